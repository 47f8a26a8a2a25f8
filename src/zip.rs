//! Random-access ZIP reader for EPUB archives.
//!
//! Parses the end-of-central-directory record (scanning up to 64 KiB of
//! archive tail, with ZIP64 locator support), indexes central directory
//! entries, and decompresses Store/Deflate payloads on demand. Enforced
//! size limits protect against zip bombs.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result, ZipLimit};

/// End of central directory signature.
const SIG_EOCD: &[u8; 4] = b"PK\x05\x06";
/// ZIP64 end of central directory locator signature.
const SIG_EOCD64_LOCATOR: &[u8; 4] = b"PK\x06\x07";
/// ZIP64 end of central directory record signature.
const SIG_EOCD64: &[u8; 4] = b"PK\x06\x06";
/// Central directory entry signature.
const SIG_CD_ENTRY: u32 = 0x0201_4b50;
/// Local file header signature.
const SIG_LOCAL_HEADER: u32 = 0x0403_4b50;

/// How far back from the end of the file the EOCD record is searched for.
const EOCD_SCAN_BYTES: u64 = 64 * 1024;

const METHOD_STORED: u16 = 0;
const METHOD_DEFLATED: u16 = 8;

/// Safety limits applied while indexing and reading entries.
#[derive(Debug, Clone, Copy)]
pub struct ZipLimits {
    pub max_entry_bytes: u64,
    pub max_entry_compressed_bytes: u64,
    pub max_total_bytes: u64,
    pub max_entries: usize,
}

impl Default for ZipLimits {
    fn default() -> Self {
        Self {
            max_entry_bytes: 256 * 1024 * 1024,
            max_entry_compressed_bytes: 64 * 1024 * 1024,
            max_total_bytes: 1024 * 1024 * 1024,
            max_entries: 65_535,
        }
    }
}

impl ZipLimits {
    /// Defaults with `SHOKO_ZIP_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut limits = Self::default();
        if let Some(v) = env_u64("SHOKO_ZIP_MAX_ENTRY_BYTES") {
            limits.max_entry_bytes = v;
        }
        if let Some(v) = env_u64("SHOKO_ZIP_MAX_ENTRY_COMPRESSED_BYTES") {
            limits.max_entry_compressed_bytes = v;
        }
        if let Some(v) = env_u64("SHOKO_ZIP_MAX_TOTAL_BYTES") {
            limits.max_total_bytes = v;
        }
        limits
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Central directory entry metadata.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    /// Normalized entry name: forward slashes, no leading `./`.
    pub name: String,
    pub method: u16,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    local_header_offset: u64,
}

/// Streaming reader over a random-access ZIP archive.
pub struct ZipReader<R: Read + Seek> {
    source: R,
    entries: Vec<ZipEntry>,
    index: HashMap<String, usize>,
    limits: ZipLimits,
    /// Uncompressed bytes handed out so far, for the total-bytes limit.
    total_uncompressed: u64,
}

impl ZipReader<File> {
    /// Open an archive from disk with environment-configured limits.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::FileNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        Self::with_limits(file, ZipLimits::from_env())
    }
}

impl<R: Read + Seek> ZipReader<R> {
    /// Index an archive from any random-access source.
    pub fn new(source: R) -> Result<Self> {
        Self::with_limits(source, ZipLimits::from_env())
    }

    pub fn with_limits(mut source: R, limits: ZipLimits) -> Result<Self> {
        let (cd_offset, cd_size, entry_count) = find_central_directory(&mut source)?;

        if entry_count > limits.max_entries as u64 {
            return Err(Error::ZipLimitExceeded(ZipLimit::Entries));
        }

        source
            .seek(SeekFrom::Start(cd_offset))
            .map_err(|e| Error::zip_read("central directory", e))?;
        let mut cd = vec![0u8; cd_size as usize];
        source
            .read_exact(&mut cd)
            .map_err(|e| Error::zip_read("central directory", e))?;

        let mut entries = Vec::with_capacity(entry_count.min(1024) as usize);
        let mut index = HashMap::new();
        let mut pos = 0usize;

        while pos + 46 <= cd.len() && entries.len() < entry_count as usize {
            if read_u32(&cd, pos) != SIG_CD_ENTRY {
                break;
            }
            let method = read_u16(&cd, pos + 10);
            let crc32 = read_u32(&cd, pos + 16);
            let mut compressed_size = read_u32(&cd, pos + 20) as u64;
            let mut uncompressed_size = read_u32(&cd, pos + 24) as u64;
            let name_len = read_u16(&cd, pos + 28) as usize;
            let extra_len = read_u16(&cd, pos + 30) as usize;
            let comment_len = read_u16(&cd, pos + 32) as usize;
            let mut local_header_offset = read_u32(&cd, pos + 42) as u64;

            let name_end = pos + 46 + name_len;
            let extra_end = name_end + extra_len;
            if extra_end + comment_len > cd.len() {
                return Err(Error::InvalidArchive(
                    "central directory record truncated".into(),
                ));
            }

            let raw_name = String::from_utf8_lossy(&cd[pos + 46..name_end]).into_owned();

            // ZIP64 extra field supplies 64-bit sizes for sentinel values.
            parse_zip64_extra(
                &cd[name_end..extra_end],
                &mut uncompressed_size,
                &mut compressed_size,
                &mut local_header_offset,
            );

            pos = extra_end + comment_len;

            let name = match normalize_entry_name(&raw_name) {
                Some(name) => name,
                None => {
                    log::warn!("skipping archive entry with unsafe name: {raw_name:?}");
                    continue;
                }
            };
            if name.is_empty() || name.ends_with('/') {
                continue; // directory entry
            }

            let idx = entries.len();
            entries.push(ZipEntry {
                name: name.clone(),
                method,
                compressed_size,
                uncompressed_size,
                crc32,
                local_header_offset,
            });
            index.entry(name).or_insert(idx);
        }

        Ok(Self {
            source,
            entries,
            index,
            limits,
            total_uncompressed: 0,
        })
    }

    /// All indexed entries, in central directory order.
    pub fn entries(&self) -> &[ZipEntry] {
        &self.entries
    }

    /// Locate an entry by normalized name, with a percent-decoded fallback
    /// for malformed EPUBs that store encoded hrefs.
    pub fn find(&self, name: &str) -> Option<&ZipEntry> {
        let normalized = normalize_entry_name(name)?;
        if let Some(&idx) = self.index.get(&normalized) {
            return self.entries.get(idx);
        }
        let decoded = percent_encoding::percent_decode_str(&normalized)
            .decode_utf8()
            .ok()?;
        self.index.get(decoded.as_ref()).map(|&idx| &self.entries[idx])
    }

    /// Read and decompress an entry by name.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .find(name)
            .cloned()
            .ok_or_else(|| Error::zip_read(name, io::Error::from(io::ErrorKind::NotFound)))?;

        if entry.compressed_size > self.limits.max_entry_compressed_bytes {
            return Err(Error::ZipLimitExceeded(ZipLimit::EntryCompressedBytes));
        }
        if entry.uncompressed_size > self.limits.max_entry_bytes {
            return Err(Error::ZipLimitExceeded(ZipLimit::EntryBytes));
        }
        if self.total_uncompressed + entry.uncompressed_size > self.limits.max_total_bytes {
            return Err(Error::ZipLimitExceeded(ZipLimit::TotalBytes));
        }

        let data_offset = self.data_offset(&entry)?;
        self.source
            .seek(SeekFrom::Start(data_offset))
            .map_err(|e| Error::zip_read(&entry.name, e))?;

        let mut compressed = vec![0u8; entry.compressed_size as usize];
        self.source
            .read_exact(&mut compressed)
            .map_err(|e| Error::zip_read(&entry.name, e))?;

        let data = match entry.method {
            METHOD_STORED => compressed,
            METHOD_DEFLATED => {
                let mut out = Vec::with_capacity(entry.uncompressed_size as usize);
                let decoder = flate2::read::DeflateDecoder::new(&compressed[..]);
                // The +1 detects streams that inflate past their declared size.
                decoder
                    .take(self.limits.max_entry_bytes + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| Error::zip_read(&entry.name, e))?;
                if out.len() as u64 > self.limits.max_entry_bytes {
                    return Err(Error::ZipLimitExceeded(ZipLimit::EntryBytes));
                }
                out
            }
            method => {
                return Err(Error::InvalidArchive(format!(
                    "unsupported compression method {method} for '{}'",
                    entry.name
                )));
            }
        };

        if entry.crc32 != 0 {
            let mut crc = flate2::Crc::new();
            crc.update(&data);
            if crc.sum() != entry.crc32 {
                return Err(Error::zip_read(
                    &entry.name,
                    io::Error::new(io::ErrorKind::InvalidData, "CRC32 mismatch"),
                ));
            }
        }

        self.total_uncompressed += data.len() as u64;
        Ok(data)
    }

    /// Resolve the payload offset past the entry's local file header.
    fn data_offset(&mut self, entry: &ZipEntry) -> Result<u64> {
        self.source
            .seek(SeekFrom::Start(entry.local_header_offset))
            .map_err(|e| Error::zip_read(&entry.name, e))?;
        let mut header = [0u8; 30];
        self.source
            .read_exact(&mut header)
            .map_err(|e| Error::zip_read(&entry.name, e))?;
        if read_u32(&header, 0) != SIG_LOCAL_HEADER {
            return Err(Error::InvalidArchive(format!(
                "bad local header for '{}'",
                entry.name
            )));
        }
        let name_len = read_u16(&header, 26) as u64;
        let extra_len = read_u16(&header, 28) as u64;
        Ok(entry.local_header_offset + 30 + name_len + extra_len)
    }
}

/// Locate the central directory via EOCD, following the ZIP64 locator
/// when the 32-bit record carries sentinel values.
fn find_central_directory<R: Read + Seek>(source: &mut R) -> Result<(u64, u64, u64)> {
    let file_size = source
        .seek(SeekFrom::End(0))
        .map_err(|e| Error::zip_read("archive tail", e))?;
    if file_size < 22 {
        return Err(Error::InvalidArchive("file too small for a ZIP".into()));
    }

    let scan_len = file_size.min(EOCD_SCAN_BYTES + 22);
    let tail_start = file_size - scan_len;
    source
        .seek(SeekFrom::Start(tail_start))
        .map_err(|e| Error::zip_read("archive tail", e))?;
    let mut tail = vec![0u8; scan_len as usize];
    source
        .read_exact(&mut tail)
        .map_err(|e| Error::zip_read("archive tail", e))?;

    let eocd_pos = memchr::memmem::rfind(&tail, SIG_EOCD)
        .ok_or_else(|| Error::InvalidArchive("no end-of-central-directory record".into()))?;
    let eocd = &tail[eocd_pos..];
    if eocd.len() < 22 {
        return Err(Error::InvalidArchive("truncated EOCD record".into()));
    }

    let entry_count = read_u16(eocd, 10) as u64;
    let cd_size = read_u32(eocd, 12) as u64;
    let cd_offset = read_u32(eocd, 16) as u64;

    let needs_zip64 =
        entry_count == 0xFFFF || cd_size == 0xFFFF_FFFF || cd_offset == 0xFFFF_FFFF;

    // The ZIP64 locator, when present, sits immediately before the EOCD.
    if eocd_pos >= 20 && &tail[eocd_pos - 20..eocd_pos - 16] == SIG_EOCD64_LOCATOR {
        let locator = &tail[eocd_pos - 20..eocd_pos];
        let eocd64_offset = read_u64(locator, 8);
        match read_eocd64(source, eocd64_offset) {
            Ok(parsed) => return Ok(parsed),
            Err(e) if needs_zip64 => return Err(e),
            // A broken locator on a small archive: the 32-bit record is
            // still authoritative.
            Err(_) => {}
        }
    } else if needs_zip64 {
        return Err(Error::InvalidArchive(
            "ZIP64 sizes without a ZIP64 locator".into(),
        ));
    }

    Ok((cd_offset, cd_size, entry_count))
}

fn read_eocd64<R: Read + Seek>(source: &mut R, offset: u64) -> Result<(u64, u64, u64)> {
    source
        .seek(SeekFrom::Start(offset))
        .map_err(|e| Error::zip_read("ZIP64 EOCD", e))?;
    let mut record = [0u8; 56];
    source
        .read_exact(&mut record)
        .map_err(|e| Error::zip_read("ZIP64 EOCD", e))?;
    if &record[0..4] != SIG_EOCD64 {
        return Err(Error::InvalidArchive("bad ZIP64 EOCD signature".into()));
    }
    let entry_count = read_u64(&record, 32);
    let cd_size = read_u64(&record, 40);
    let cd_offset = read_u64(&record, 48);
    Ok((cd_offset, cd_size, entry_count))
}

/// Scan a central-directory extra field for the ZIP64 (0x0001) record.
fn parse_zip64_extra(
    mut extra: &[u8],
    uncompressed: &mut u64,
    compressed: &mut u64,
    local_offset: &mut u64,
) {
    while extra.len() >= 4 {
        let id = read_u16(extra, 0);
        let len = read_u16(extra, 2) as usize;
        if extra.len() < 4 + len {
            return;
        }
        if id == 0x0001 {
            let mut field = &extra[4..4 + len];
            // Values appear in a fixed order, only for sentinel fields.
            for target in [uncompressed, compressed, local_offset] {
                if *target == 0xFFFF_FFFF && field.len() >= 8 {
                    *target = read_u64(field, 0);
                    field = &field[8..];
                }
            }
            return;
        }
        extra = &extra[4 + len..];
    }
}

/// Normalize an entry name; returns `None` for traversal attempts.
fn normalize_entry_name(name: &str) -> Option<String> {
    let mut name = name.replace('\\', "/");
    while let Some(rest) = name.strip_prefix("./") {
        name = rest.to_string();
    }
    let name = name.trim_start_matches('/').to_string();
    if name.split('/').any(|part| part == "..") {
        return None;
    }
    Some(name)
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
