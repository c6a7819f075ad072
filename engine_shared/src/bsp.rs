//! BSP entity lump reader.
//!
//! Geometry belongs to the renderer and physics backends; the network core
//! needs only the header (to validate the file) and the entity lump (to spawn
//! map entities and find spawn points).
//!
//! Reference: <https://developer.valvesoftware.com/wiki/Source_BSP_File_Format>

use std::collections::BTreeMap;

use anyhow::{bail, ensure, Context};

use crate::math::Vec3;

/// "VBSP" in little-endian.
pub const BSP_MAGIC: u32 = 0x5053_4256;
pub const BSP_VERSION_MIN: u32 = 19;
pub const BSP_VERSION_MAX: u32 = 21;
pub const HEADER_LUMPS: usize = 64;

const LUMP_ENTITIES: usize = 0;
const LUMP_ENTRY_LEN: usize = 16;
/// magic + version + lump table + map revision
pub const HEADER_LEN: usize = 8 + HEADER_LUMPS * LUMP_ENTRY_LEN + 4;

/// Location of one lump in the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LumpEntry {
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub struct BspHeader {
    pub version: u32,
    pub map_revision: u32,
    pub lumps: Vec<LumpEntry>,
}

/// One `{ "key" "value" ... }` block from the entity lump.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BspEntity {
    pub classname: String,
    pub properties: BTreeMap<String, String>,
}

impl BspEntity {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn origin(&self) -> Option<Vec3> {
        self.get("origin").and_then(parse_vec3)
    }

    /// Pitch, yaw, roll.
    pub fn angles(&self) -> Option<Vec3> {
        self.get("angles").and_then(parse_vec3)
    }

    pub fn is_spawn_point(&self) -> bool {
        self.classname.starts_with("info_player")
    }
}

fn parse_vec3(s: &str) -> Option<Vec3> {
    let mut it = s.split_whitespace().map(str::parse::<f32>);
    let v = Vec3::new(it.next()?.ok()?, it.next()?.ok()?, it.next()?.ok()?);
    it.next().is_none().then_some(v)
}

fn le_u32(data: &[u8], at: usize) -> anyhow::Result<u32> {
    let bytes = data
        .get(at..at + 4)
        .with_context(|| format!("truncated at offset {at}"))?;
    Ok(u32::from_le_bytes(bytes.try_into()?))
}

/// Validates magic and version and reads the lump table.
pub fn parse_header(data: &[u8]) -> anyhow::Result<BspHeader> {
    ensure!(
        data.len() >= HEADER_LEN,
        "file too small for BSP header ({} bytes)",
        data.len()
    );
    let magic = le_u32(data, 0)?;
    if magic != BSP_MAGIC {
        bail!("invalid BSP magic: {magic:#x}");
    }
    let version = le_u32(data, 4)?;
    if !(BSP_VERSION_MIN..=BSP_VERSION_MAX).contains(&version) {
        bail!("unsupported BSP version: {version}");
    }

    let lumps = (0..HEADER_LUMPS)
        .map(|i| {
            let at = 8 + i * LUMP_ENTRY_LEN;
            Ok(LumpEntry {
                offset: le_u32(data, at)?,
                length: le_u32(data, at + 4)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let map_revision = le_u32(data, 8 + HEADER_LUMPS * LUMP_ENTRY_LEN)?;

    Ok(BspHeader {
        version,
        map_revision,
        lumps,
    })
}

/// Reads the entity list of a whole BSP file.
pub fn read_entities(data: &[u8]) -> anyhow::Result<Vec<BspEntity>> {
    let header = parse_header(data)?;
    let lump = header.lumps[LUMP_ENTITIES];
    let start = lump.offset as usize;
    let end = start
        .checked_add(lump.length as usize)
        .context("entity lump length overflows")?;
    let bytes = data
        .get(start..end)
        .with_context(|| format!("entity lump {start}..{end} outside file of {} bytes", data.len()))?;
    // The lump is NUL-terminated text.
    let text = String::from_utf8_lossy(bytes);
    parse_entity_lump(text.trim_end_matches('\0'))
}

/// Parses entity lump text: a sequence of brace blocks of quoted key/value pairs.
pub fn parse_entity_lump(text: &str) -> anyhow::Result<Vec<BspEntity>> {
    let mut entities = Vec::new();
    let mut tokens = Tokens { rest: text };
    while let Some(tok) = tokens.next_token()? {
        match tok {
            Token::Open => entities.push(parse_block(&mut tokens)?),
            other => bail!("expected '{{', found {other:?}"),
        }
    }
    Ok(entities)
}

fn parse_block(tokens: &mut Tokens<'_>) -> anyhow::Result<BspEntity> {
    let mut ent = BspEntity::default();
    loop {
        let key = match tokens.next_token()? {
            Some(Token::Close) => return Ok(ent),
            Some(Token::Quoted(k)) => k,
            Some(Token::Open) => bail!("nested '{{' in entity block"),
            None => bail!("unterminated entity block"),
        };
        let value = match tokens.next_token()? {
            Some(Token::Quoted(v)) => v,
            other => bail!("key \"{key}\" has no value (found {other:?})"),
        };
        if key == "classname" {
            ent.classname = value.to_string();
        }
        ent.properties.insert(key.to_string(), value.to_string());
    }
}

#[derive(Debug, PartialEq)]
enum Token<'a> {
    Open,
    Close,
    Quoted(&'a str),
}

struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn next_token(&mut self) -> anyhow::Result<Option<Token<'a>>> {
        self.rest = self.rest.trim_start();
        let Some(c) = self.rest.chars().next() else {
            return Ok(None);
        };
        match c {
            '{' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::Open))
            }
            '}' => {
                self.rest = &self.rest[1..];
                Ok(Some(Token::Close))
            }
            '"' => {
                let body = &self.rest[1..];
                let end = body.find('"').context("unterminated quoted string")?;
                self.rest = &body[end + 1..];
                Ok(Some(Token::Quoted(&body[..end])))
            }
            other => bail!("unexpected character {other:?} in entity lump"),
        }
    }
}

/// Builds a minimal BSP file whose entity lump holds `text`.
#[cfg(test)]
pub(crate) fn build_bsp(text: &str) -> Vec<u8> {
    let mut data = vec![0u8; HEADER_LEN];
    data[0..4].copy_from_slice(&BSP_MAGIC.to_le_bytes());
    data[4..8].copy_from_slice(&20u32.to_le_bytes());
    let offset = HEADER_LEN as u32;
    let length = text.len() as u32 + 1;
    data[8..12].copy_from_slice(&offset.to_le_bytes());
    data[12..16].copy_from_slice(&length.to_le_bytes());
    data.extend_from_slice(text.as_bytes());
    data.push(0);
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    const LUMP: &str = r#"
{
"classname" "worldspawn"
"mapversion" "1"
}
{ "classname" "info_player_start" "origin" "0 0 64" "angles" "0 90 0" }
{
"classname" "light"
"origin" "12 -4 100"
"_light" "255 255 255 200"
}
"#;

    #[test]
    fn parse_entity_lump_basic() {
        let ents = parse_entity_lump(LUMP).unwrap();
        assert_eq!(ents.len(), 3);
        assert_eq!(ents[0].classname, "worldspawn");
        assert!(ents[1].is_spawn_point());
        assert_eq!(ents[1].origin(), Some(Vec3::new(0.0, 0.0, 64.0)));
        assert_eq!(ents[1].angles(), Some(Vec3::new(0.0, 90.0, 0.0)));
        assert_eq!(ents[2].get("_light"), Some("255 255 255 200"));
        assert_eq!(ents[2].origin(), Some(Vec3::new(12.0, -4.0, 100.0)));
    }

    #[test]
    fn malformed_lumps_are_errors() {
        assert!(parse_entity_lump("{ \"classname\" }").is_err());
        assert!(parse_entity_lump("{ \"classname\" \"x\"").is_err());
        assert!(parse_entity_lump("\"stray\"").is_err());
        assert!(parse_entity_lump("{ \"a\" \"b }").is_err());
    }

    #[test]
    fn reads_entities_from_file_bytes() {
        let data = build_bsp(LUMP);
        let header = parse_header(&data).unwrap();
        assert_eq!(header.version, 20);
        let ents = read_entities(&data).unwrap();
        assert_eq!(ents.len(), 3);
    }

    #[test]
    fn rejects_bad_header() {
        let mut data = build_bsp(LUMP);
        data[0] = b'X';
        assert!(read_entities(&data).is_err());

        let mut data = build_bsp(LUMP);
        data[4..8].copy_from_slice(&30u32.to_le_bytes());
        assert!(read_entities(&data).is_err());

        assert!(read_entities(&[0u8; 10]).is_err());

        let mut data = build_bsp(LUMP);
        data[12..16].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(read_entities(&data).is_err());
    }

    #[test]
    fn vec3_property_needs_three_numbers() {
        assert_eq!(parse_vec3("1 2"), None);
        assert_eq!(parse_vec3("1 2 3 4"), None);
        assert_eq!(parse_vec3("1 x 3"), None);
    }
}
