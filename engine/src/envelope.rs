//! Recognition and parsing of the model's `<changes>` edit envelope.
//!
//! The wire format is XML inside markdown emitted by a stochastic model, so
//! the envelope is located by substring search first (a surrounding code
//! fence falls away for free) and only that region is fed to the XML
//! parser. Malformed XML is never auto-corrected — it fails loudly and the
//! apply is aborted. `<content>` and `<path>` payloads are opaque CDATA;
//! unknown elements and attributes are ignored.
//!
//! Two record shapes are accepted: `<change type="update|delete">` with a
//! whole-file `<content>`, and `<file_update>` with `<operations>` of
//! `<block>` entries keyed by navigational path (either `<path>`/`<content>`
//! children or the legacy `name` attribute with a CDATA body).

use atelier_types::{BlockPathError, EditKind, FileEdit};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use thiserror::Error;

const OPEN_TAG: &str = "<changes";
const CLOSE_TAG: &str = "</changes>";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("model output contains no <changes> envelope")]
    NotFound,
    #[error("<changes> envelope is never terminated")]
    Unterminated,
    #[error("malformed envelope XML: {0}")]
    Malformed(String),
    #[error("update record for {path:?} is missing <content>")]
    MissingContent { path: String },
    #[error("invalid block path: {0}")]
    BadBlockPath(#[from] BlockPathError),
}

/// Byte range of the `<changes>…</changes>` region inside `text`, tags
/// inclusive, or `None` when no opening tag exists.
#[must_use]
pub fn find_envelope(text: &str) -> Option<(usize, Option<usize>)> {
    let mut from = 0;
    let start = loop {
        let pos = text[from..].find(OPEN_TAG)? + from;
        // Reject prefixes of longer element names (e.g. <changeset>).
        match text[pos + OPEN_TAG.len()..].chars().next() {
            Some('>' | '/') => break pos,
            Some(c) if c.is_ascii_whitespace() => break pos,
            _ => from = pos + OPEN_TAG.len(),
        }
    };
    if let Some(rel) = text[start..].find(CLOSE_TAG) {
        return Some((start, Some(start + rel + CLOSE_TAG.len())));
    }
    if text[start..].starts_with("<changes/>") {
        return Some((start, Some(start + "<changes/>".len())));
    }
    Some((start, None))
}

/// Parse every edit out of the envelope in `text`.
///
/// The returned list is in envelope order. Any envelope-level failure is an
/// error — the caller must not apply a partial batch.
pub fn parse_changes(text: &str) -> Result<Vec<FileEdit>, EnvelopeError> {
    let (start, end) = find_envelope(text).ok_or(EnvelopeError::NotFound)?;
    let end = end.ok_or(EnvelopeError::Unterminated)?;
    parse_envelope(&text[start..end])
}

fn malformed(err: impl std::fmt::Display) -> EnvelopeError {
    EnvelopeError::Malformed(err.to_string())
}

fn parse_envelope(envelope: &str) -> Result<Vec<FileEdit>, EnvelopeError> {
    let mut reader = Reader::from_reader(envelope.as_bytes());
    let mut edits = Vec::new();

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(element) => match element.name().as_ref() {
                b"changes" => {}
                b"change" => {
                    let kind = change_kind(&element);
                    if let Some(edit) = parse_change(&mut reader, kind)? {
                        edits.push(edit);
                    }
                }
                b"file_update" => edits.extend(parse_file_update(&mut reader)?),
                _ => skip_element(&mut reader, &element)?,
            },
            Event::End(element) if element.name().as_ref() == b"changes" => break,
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(edits)
}

/// The `type` attribute of a `<change>`; anything unrecognized falls back
/// to `update`, matching the tolerant behavior of the envelope's producers.
fn change_kind(element: &BytesStart<'_>) -> EditKind {
    for attr in element.attributes().flatten() {
        if attr.key.as_ref() == b"type" {
            return match attr.value.as_ref() {
                b"delete" => EditKind::Delete,
                b"update" => EditKind::Update,
                other => {
                    tracing::warn!(
                        kind = %String::from_utf8_lossy(other),
                        "Unknown change type; treating as update"
                    );
                    EditKind::Update
                }
            };
        }
    }
    EditKind::Update
}

fn parse_change(
    reader: &mut Reader<&[u8]>,
    kind: EditKind,
) -> Result<Option<FileEdit>, EnvelopeError> {
    let mut file: Option<String> = None;
    let mut description = String::new();
    let mut content: Option<String> = None;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(element) => match element.name().as_ref() {
                b"file" => file = Some(read_text(reader, b"file")?.trim().to_string()),
                b"description" => description = read_text(reader, b"description")?.trim().to_string(),
                b"content" => content = Some(read_text(reader, b"content")?),
                _ => skip_element(reader, &element)?,
            },
            Event::Empty(element) if element.name().as_ref() == b"content" => {
                content = Some(String::new());
            }
            Event::End(element) if element.name().as_ref() == b"change" => break,
            Event::Eof => return Err(EnvelopeError::Malformed("unterminated <change>".into())),
            _ => {}
        }
    }

    let Some(file) = file.filter(|f| !f.is_empty()) else {
        tracing::warn!("<change> record without a <file>; skipped");
        return Ok(None);
    };

    match kind {
        EditKind::Update => {
            let Some(content) = content else {
                return Err(EnvelopeError::MissingContent { path: file });
            };
            Ok(Some(FileEdit::update(file, content).with_description(description)))
        }
        EditKind::Delete => {
            if content.is_some() {
                tracing::warn!(path = %file, "Delete record carries content; ignoring it");
            }
            Ok(Some(FileEdit::delete(file).with_description(description)))
        }
    }
}

fn parse_file_update(reader: &mut Reader<&[u8]>) -> Result<Vec<FileEdit>, EnvelopeError> {
    let mut file: Option<String> = None;
    let mut description = String::new();
    let mut blocks: Vec<(String, String)> = Vec::new();

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(element) => match element.name().as_ref() {
                b"file" => file = Some(read_text(reader, b"file")?.trim().to_string()),
                b"description" => description = read_text(reader, b"description")?.trim().to_string(),
                b"operations" => parse_operations(reader, &mut blocks)?,
                _ => skip_element(reader, &element)?,
            },
            Event::End(element) if element.name().as_ref() == b"file_update" => break,
            Event::Eof => {
                return Err(EnvelopeError::Malformed("unterminated <file_update>".into()));
            }
            _ => {}
        }
    }

    let Some(file) = file.filter(|f| !f.is_empty()) else {
        tracing::warn!("<file_update> record without a <file>; skipped");
        return Ok(Vec::new());
    };

    let mut edits = Vec::with_capacity(blocks.len());
    for (path, content) in blocks {
        let block_path = atelier_types::BlockPath::parse(&path)?;
        edits.push(
            FileEdit::block_update(file.clone(), block_path, content)
                .with_description(description.clone()),
        );
    }
    Ok(edits)
}

fn parse_operations(
    reader: &mut Reader<&[u8]>,
    blocks: &mut Vec<(String, String)>,
) -> Result<(), EnvelopeError> {
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(element) => match element.name().as_ref() {
                b"block" => {
                    let legacy_name = block_name_attribute(&element);
                    if let Some(block) = parse_block(reader, legacy_name)? {
                        blocks.push(block);
                    }
                }
                _ => skip_element(reader, &element)?,
            },
            Event::End(element) if element.name().as_ref() == b"operations" => break,
            Event::Eof => {
                return Err(EnvelopeError::Malformed("unterminated <operations>".into()));
            }
            _ => {}
        }
    }
    Ok(())
}

fn block_name_attribute(element: &BytesStart<'_>) -> Option<String> {
    element.attributes().flatten().find_map(|attr| {
        (attr.key.as_ref() == b"name")
            .then(|| String::from_utf8_lossy(attr.value.as_ref()).into_owned())
    })
}

/// One `<block>`: either `<path>`/`<content>` children, or the legacy
/// `name` attribute with a CDATA body.
fn parse_block(
    reader: &mut Reader<&[u8]>,
    legacy_name: Option<String>,
) -> Result<Option<(String, String)>, EnvelopeError> {
    let mut path: Option<String> = None;
    let mut content: Option<String> = None;
    let mut cdata_body = String::new();
    let mut text_body = String::new();

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(element) => match element.name().as_ref() {
                b"path" => path = Some(read_text(reader, b"path")?.trim().to_string()),
                b"content" => content = Some(read_text(reader, b"content")?),
                _ => skip_element(reader, &element)?,
            },
            Event::CData(cdata) => {
                cdata_body.push_str(&String::from_utf8_lossy(&cdata.into_inner()));
            }
            Event::Text(text) => text_body.push_str(&text.unescape().map_err(malformed)?),
            Event::End(element) if element.name().as_ref() == b"block" => break,
            Event::Eof => return Err(EnvelopeError::Malformed("unterminated <block>".into())),
            _ => {}
        }
    }

    let Some(path) = path.or(legacy_name).filter(|p| !p.is_empty()) else {
        tracing::warn!("<block> without a path or name; skipped");
        return Ok(None);
    };
    let content = content.unwrap_or_else(|| {
        if cdata_body.is_empty() {
            text_body.trim().to_string()
        } else {
            cdata_body
        }
    });
    Ok(Some((path, content)))
}

/// Accumulate the text of a leaf element (Text and CDATA, concatenated)
/// until its end tag. Unexpected child elements are skipped.
fn read_text(reader: &mut Reader<&[u8]>, name: &[u8]) -> Result<String, EnvelopeError> {
    let mut out = String::new();
    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Text(text) => out.push_str(&text.unescape().map_err(malformed)?),
            Event::CData(cdata) => out.push_str(&String::from_utf8_lossy(&cdata.into_inner())),
            Event::Start(element) => skip_element(reader, &element)?,
            Event::End(element) if element.name().as_ref() == name => break,
            Event::Eof => {
                return Err(EnvelopeError::Malformed(format!(
                    "unterminated <{}>",
                    String::from_utf8_lossy(name)
                )));
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Consume an unknown element entirely, children included.
fn skip_element(reader: &mut Reader<&[u8]>, element: &BytesStart<'_>) -> Result<(), EnvelopeError> {
    let name = element.name().as_ref().to_vec();
    reader.read_to_end(QName(&name)).map_err(malformed)?;
    Ok(())
}
