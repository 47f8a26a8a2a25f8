//! Shared EPUB fixture builder for integration tests.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::fs::File;
use std::io::Write;
use std::path::Path;

use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Builds a small but well-formed EPUB on disk.
pub struct EpubBuilder {
    title: String,
    /// `(href, body_xhtml)` in spine order.
    chapters: Vec<(String, String)>,
    /// NCX nav points: `(label, src)`.
    nav_points: Vec<(String, String)>,
}

impl EpubBuilder {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            chapters: Vec::new(),
            nav_points: Vec::new(),
        }
    }

    pub fn chapter(mut self, href: &str, body: &str) -> Self {
        self.chapters.push((href.to_string(), body.to_string()));
        self
    }

    pub fn nav_point(mut self, label: &str, src: &str) -> Self {
        self.nav_points.push((label.to_string(), src.to_string()));
        self
    }

    pub fn write_to(self, path: &Path) {
        let file = File::create(path).expect("create epub fixture");
        let mut writer = ZipWriter::new(file);
        let stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        let deflated = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);

        writer.start_file("mimetype", stored).unwrap();
        writer.write_all(b"application/epub+zip").unwrap();

        writer.start_file("META-INF/container.xml", deflated).unwrap();
        writer
            .write_all(
                br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#,
            )
            .unwrap();

        let mut manifest = String::new();
        let mut spine = String::new();
        for (i, (href, _)) in self.chapters.iter().enumerate() {
            manifest.push_str(&format!(
                r#"    <item id="ch{i}" href="{href}" media-type="application/xhtml+xml"/>
"#
            ));
            spine.push_str(&format!("    <itemref idref=\"ch{i}\"/>\n"));
        }
        if !self.nav_points.is_empty() {
            manifest.push_str(
                "    <item id=\"ncx\" href=\"toc.ncx\" media-type=\"application/x-dtbncx+xml\"/>\n",
            );
        }

        let opf = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{}</dc:title>
    <dc:creator>Fixture Author</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>"#,
            self.title
        );
        writer.start_file("OEBPS/content.opf", deflated).unwrap();
        writer.write_all(opf.as_bytes()).unwrap();

        if !self.nav_points.is_empty() {
            let mut points = String::new();
            for (i, (label, src)) in self.nav_points.iter().enumerate() {
                points.push_str(&format!(
                    r#"    <navPoint id="np{i}" playOrder="{}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{src}"/>
    </navPoint>
"#,
                    i + 1
                ));
            }
            let ncx = format!(
                r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
{points}  </navMap>
</ncx>"#
            );
            writer.start_file("OEBPS/toc.ncx", deflated).unwrap();
            writer.write_all(ncx.as_bytes()).unwrap();
        }

        for (href, body) in &self.chapters {
            let doc = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml">
<head><title>chapter</title></head>
<body>{body}</body>
</html>"#
            );
            writer
                .start_file(format!("OEBPS/{href}"), deflated)
                .unwrap();
            writer.write_all(doc.as_bytes()).unwrap();
        }

        writer.finish().unwrap();
    }
}

/// The scenario-1 book: one chapter, heading plus paragraph.
pub fn trivial_epub(path: &Path) {
    EpubBuilder::new("Trivial")
        .chapter("ch1.xhtml", "<h1>Hello</h1><p>World</p>")
        .nav_point("Hello", "ch1.xhtml")
        .write_to(path);
}
