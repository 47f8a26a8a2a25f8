//! Package document (OPF) and container.xml parsing.

use std::collections::{BTreeMap, HashMap};

use quick_xml::Reader;
use quick_xml::events::Event;

use crate::epub::{local_name, resolve_entity};
use crate::error::{Error, Result};

/// A manifest item keyed by id.
#[derive(Debug, Clone)]
pub struct ManifestItem {
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

/// Metadata collected from the OPF `metadata` element.
#[derive(Debug, Clone, Default)]
pub struct OpfMetadata {
    pub title: String,
    pub language: String,
    pub authors: Vec<String>,
    pub year: Option<String>,
    /// Remaining Dublin Core fields by local name.
    pub misc: BTreeMap<String, String>,
}

/// Parsed package document.
#[derive(Debug, Clone, Default)]
pub struct OpfData {
    pub metadata: OpfMetadata,
    /// Maps manifest id -> item.
    pub manifest: HashMap<String, (String, String)>,
    pub spine_ids: Vec<String>,
    /// Manifest id of the NCX document, from `<spine toc="...">`.
    pub ncx_id: Option<String>,
    /// Href of the EPUB3 XHTML nav document, when declared.
    pub nav_href: Option<String>,
    /// Href of the cover image, EPUB3 property first, EPUB2 meta fallback.
    pub cover_href: Option<String>,
}

/// Parse `META-INF/container.xml` and return the package document path.
pub fn parse_container_xml(content: &str) -> Result<String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event() {
            Ok(Event::Empty(e)) | Ok(Event::Start(e))
                if local_name(e.name().as_ref()) == b"rootfile" =>
            {
                for attr in e.attributes().flatten() {
                    if attr.key.as_ref() == b"full-path" {
                        return Ok(String::from_utf8_lossy(&attr.value).into_owned());
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    Err(Error::InvalidArchive(
        "no rootfile found in container.xml".into(),
    ))
}

/// Parse the package document. Metadata queries are namespace-agnostic:
/// only local names are matched.
pub fn parse_opf(content: &str) -> Result<OpfData> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut metadata = OpfMetadata::default();
    let mut manifest_items: HashMap<String, ManifestItem> = HashMap::new();
    let mut spine_ids = Vec::new();
    let mut ncx_id = None;
    let mut epub2_cover_id: Option<String> = None;

    let mut in_metadata = false;
    let mut current_element: Option<String> = None;
    let mut buf_text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"metadata" => in_metadata = true,
                    b"spine" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"toc" {
                                ncx_id = Some(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    local if in_metadata => {
                        current_element = Some(String::from_utf8_lossy(local).into_owned());
                        buf_text.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"item" => {
                        if let Some((id, item)) = parse_manifest_item(&e)? {
                            manifest_items.insert(id, item);
                        }
                    }
                    b"itemref" => {
                        for attr in e.attributes().flatten() {
                            if attr.key.as_ref() == b"idref" {
                                spine_ids
                                    .push(String::from_utf8_lossy(&attr.value).into_owned());
                            }
                        }
                    }
                    b"meta" => {
                        // EPUB2 cover declaration: <meta name="cover" content="id"/>
                        let mut is_cover = false;
                        let mut cover_id = String::new();
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"name" if attr.value.as_ref() == b"cover" => is_cover = true,
                                b"content" => {
                                    cover_id =
                                        String::from_utf8_lossy(&attr.value).into_owned();
                                }
                                _ => {}
                            }
                        }
                        if is_cover && !cover_id.is_empty() {
                            epub2_cover_id = Some(cover_id);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(e)) => {
                if current_element.is_some() {
                    buf_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Ok(Event::GeneralRef(e)) => {
                if current_element.is_some() {
                    let entity = String::from_utf8_lossy(e.as_ref());
                    buf_text.push_str(resolve_entity(&entity));
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                let local = local_name(name.as_ref());
                if local == b"metadata" {
                    in_metadata = false;
                }
                if let Some(elem) = current_element.take() {
                    record_metadata_field(&mut metadata, &elem, buf_text.trim());
                    buf_text.clear();
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::Xml(e)),
            _ => {}
        }
    }

    if metadata.language.is_empty() {
        metadata.language = "en".to_string();
    }
    metadata.language = expand_language(&metadata.language);

    // EPUB3 cover-image property takes priority over the EPUB2 meta.
    let cover_href = manifest_items
        .values()
        .find(|item| {
            item.properties.as_deref().is_some_and(|props| {
                props.split_ascii_whitespace().any(|p| p == "cover-image")
            })
        })
        .map(|item| item.href.clone())
        .or_else(|| {
            epub2_cover_id
                .and_then(|id| manifest_items.get(&id).map(|item| item.href.clone()))
        });

    let nav_href = manifest_items
        .values()
        .find(|item| {
            item.properties
                .as_deref()
                .is_some_and(|props| props.split_ascii_whitespace().any(|p| p == "nav"))
        })
        .map(|item| item.href.clone());

    let manifest = manifest_items
        .into_iter()
        .map(|(id, item)| (id, (item.href, item.media_type)))
        .collect();

    Ok(OpfData {
        metadata,
        manifest,
        spine_ids,
        ncx_id,
        nav_href,
        cover_href,
    })
}

fn parse_manifest_item(
    e: &quick_xml::events::BytesStart<'_>,
) -> Result<Option<(String, ManifestItem)>> {
    let mut id = String::new();
    let mut href = String::new();
    let mut media_type = String::new();
    let mut properties = None;

    for attr in e.attributes().flatten() {
        let value = String::from_utf8_lossy(&attr.value).into_owned();
        match attr.key.as_ref() {
            b"id" => id = value,
            b"href" => href = value,
            b"media-type" => media_type = value,
            b"properties" => properties = Some(value),
            _ => {}
        }
    }

    if id.is_empty() || href.is_empty() {
        return Ok(None);
    }
    Ok(Some((
        id,
        ManifestItem {
            href,
            media_type,
            properties,
        },
    )))
}

fn record_metadata_field(metadata: &mut OpfMetadata, element: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    match element {
        "title" => {
            if metadata.title.is_empty() {
                metadata.title = text.to_string();
            }
        }
        "creator" => metadata.authors.push(text.to_string()),
        "language" => metadata.language = text.to_string(),
        "date" => {
            if metadata.year.is_none() {
                // Keep only the year component of ISO-style dates.
                let year: String = text.chars().take_while(|c| c.is_ascii_digit()).collect();
                metadata.year = Some(if year.len() == 4 { year } else { text.to_string() });
            }
        }
        other => {
            metadata
                .misc
                .entry(other.to_string())
                .or_insert_with(|| text.to_string());
        }
    }
}

/// Expand a language tag missing a region: `en` becomes `en_EN`,
/// `pt-br` becomes `pt_BR`.
pub fn expand_language(lang: &str) -> String {
    let normalized = lang.trim().replace('-', "_");
    let mut parts = normalized.splitn(2, '_');
    let base = parts.next().unwrap_or("en").to_lowercase();
    match parts.next() {
        Some(region) if !region.is_empty() => format!("{base}_{}", region.to_uppercase()),
        _ => {
            let region = base.to_uppercase();
            format!("{base}_{region}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>A Study in Scarlet</dc:title>
    <dc:creator>Arthur Conan Doyle</dc:creator>
    <dc:language>en</dc:language>
    <dc:date>1887-01-01</dc:date>
    <dc:publisher>Ward Lock &amp; Co</dc:publisher>
  </metadata>
  <manifest>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="ch2" href="text/ch2.xhtml" media-type="application/xhtml+xml"/>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="cover-img" href="images/cover.png" media-type="image/png" properties="cover-image"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="ch1"/>
    <itemref idref="ch2"/>
  </spine>
</package>"#;

    #[test]
    fn container_yields_opf_path() {
        assert_eq!(parse_container_xml(CONTAINER).unwrap(), "OEBPS/content.opf");
    }

    #[test]
    fn container_without_rootfile_is_invalid() {
        assert!(parse_container_xml("<container/>").is_err());
    }

    #[test]
    fn opf_collects_metadata_and_spine() {
        let opf = parse_opf(OPF).unwrap();
        assert_eq!(opf.metadata.title, "A Study in Scarlet");
        assert_eq!(opf.metadata.authors, vec!["Arthur Conan Doyle"]);
        assert_eq!(opf.metadata.language, "en_EN");
        assert_eq!(opf.metadata.year.as_deref(), Some("1887"));
        assert_eq!(
            opf.metadata.misc.get("publisher").map(String::as_str),
            Some("Ward Lock & Co")
        );
        assert_eq!(opf.spine_ids, vec!["ch1", "ch2"]);
        assert_eq!(opf.ncx_id.as_deref(), Some("ncx"));
        assert_eq!(opf.nav_href.as_deref(), Some("nav.xhtml"));
        assert_eq!(opf.cover_href.as_deref(), Some("images/cover.png"));
        assert_eq!(
            opf.manifest.get("ch1").map(|(h, _)| h.as_str()),
            Some("text/ch1.xhtml")
        );
    }

    #[test]
    fn language_region_expansion() {
        assert_eq!(expand_language("en"), "en_EN");
        assert_eq!(expand_language("pt-br"), "pt_BR");
        assert_eq!(expand_language("ja_JP"), "ja_JP");
        assert_eq!(expand_language("DE"), "de_DE");
    }
}
