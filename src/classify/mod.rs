//! Content-unit classification.
//!
//! Turns a unit's header region into a [`ContentUnit`] (title id, version,
//! type).  Parsing is lazy: nothing here runs unless a caller asks for it
//! through a [`CnmtPolicy`] other than `Never`.

pub mod cnmt;

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::archive::Archive;
use crate::container::nca::{self, NcaContentType, NcaHeader, NCA_HEADER_SIZE};
use crate::container::pfs0::Pfs0Header;
use crate::container::{Container, FileKind};
use crate::crypto;
use crate::error::{NszError, Result};
use crate::keys::HeaderKey;
use self::cnmt::{Cnmt, MetaType};

const MAX_CNMT_SIZE: u64 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitType {
    Program,
    Update,
    AddOnContent,
    Control,
    LegalInfo,
    DeltaFragment,
    Other,
}

impl UnitType {
    /// Program-type units are split by the low 12 bits of their title id.
    pub fn from_title_id(title_id: u64) -> Self {
        match title_id & 0xFFF {
            0 => UnitType::Program,
            0x800 => UnitType::Update,
            _ => UnitType::AddOnContent,
        }
    }

    /// Types that identify a whole title, as opposed to its supporting data.
    pub fn is_primary(self) -> bool {
        matches!(self, UnitType::Program | UnitType::Update | UnitType::AddOnContent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CnmtPolicy {
    /// No parsing; everything is compressed generically.
    Never,
    /// Parse each unit's own header.
    #[default]
    OnDemand,
    /// Also read the title's CNMT for its version and delta fragments.
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentUnit {
    pub name:          String,
    pub title_id:      u64,
    pub version:       u32,
    pub unit_type:     UnitType,
    pub header_region: usize,
    pub body_region:   Option<usize>,
}

#[derive(Debug, Default)]
pub struct Classification {
    pub units:    Vec<ContentUnit>,
    pub cnmt:     Option<Cnmt>,
    /// Units that could not be classified.  Never fatal to compression.
    pub failures: Vec<NszError>,
}

impl Classification {
    pub fn unit_for_header(&self, region: usize) -> Option<&ContentUnit> {
        self.units.iter().find(|u| u.header_region == region)
    }

    pub fn unit_for_body(&self, region: usize) -> Option<&ContentUnit> {
        self.units.iter().find(|u| u.body_region == Some(region))
    }

    /// The unit that names the container as a whole.
    pub fn primary(&self) -> Option<&ContentUnit> {
        self.units
            .iter()
            .find(|u| u.unit_type.is_primary())
            .or_else(|| self.units.first())
    }
}

/// Map a decoded header to a unit type.  Meta units are refined from the
/// CNMT when one is read.
pub fn unit_type_of(header: &NcaHeader) -> UnitType {
    match header.content_type {
        NcaContentType::Program    => UnitType::from_title_id(header.title_id),
        NcaContentType::Control    => UnitType::Control,
        NcaContentType::Manual     => UnitType::LegalInfo,
        NcaContentType::PublicData => UnitType::AddOnContent,
        NcaContentType::Meta | NcaContentType::Data | NcaContentType::Unknown(_) => UnitType::Other,
    }
}

fn meta_unit_type(meta: MetaType) -> UnitType {
    match meta {
        MetaType::Application  => UnitType::Program,
        MetaType::Patch        => UnitType::Update,
        MetaType::AddOnContent => UnitType::AddOnContent,
        MetaType::Delta | MetaType::Other(_) => UnitType::Other,
    }
}

/// Decode a header region's bytes, decrypting with `key` when needed.
pub fn decode_header(path: &Path, field: &str, raw: &[u8], key: Option<&HeaderKey>) -> Result<NcaHeader> {
    let unrecognized = |message: String| NszError::UnrecognizedMetadata {
        path: path.to_owned(),
        field: field.to_owned(),
        message,
    };
    if raw.len() < NCA_HEADER_SIZE {
        return Err(unrecognized(format!("{} bytes is shorter than an NCA header", raw.len())));
    }
    let plain = if nca::is_plaintext(raw) {
        raw[..NCA_HEADER_SIZE].to_vec()
    } else {
        let key = key.ok_or_else(|| unrecognized("header is encrypted and no header key is configured".into()))?;
        crypto::decrypt_header(raw, &key.0).map_err(|e| unrecognized(e.to_string()))?
    };
    NcaHeader::parse(&plain).map_err(|e| unrecognized(e.to_string()))
}

/// The 32-hex-digit content id an NCA file name carries, if any.
pub fn nca_id_of(name: &str) -> Option<String> {
    let file = name.rsplit('/').next()?;
    let lower = file.to_ascii_lowercase();
    let stem = lower.strip_suffix(".nca")?;
    let stem = stem.strip_suffix(".cnmt").unwrap_or(stem);
    (stem.len() == 32 && stem.bytes().all(|b| b.is_ascii_hexdigit())).then(|| stem.to_string())
}

/// Classify every content unit in a container.
pub fn classify_container(container: &Container, policy: CnmtPolicy, key: Option<&HeaderKey>) -> Result<Classification> {
    let mut out = Classification::default();
    if policy == CnmtPolicy::Never {
        return Ok(out);
    }
    let mut file = container.open_file()?;
    let mut metas = Vec::new();

    for (idx, region) in container.unit_headers() {
        let read_len = region.length.min(NCA_HEADER_SIZE as u64) as usize;
        let raw = container.read_range(&mut file, region.offset, read_len)?;
        match decode_header(&container.path, &region.name, &raw, key) {
            Ok(header) => {
                if header.content_type == NcaContentType::Meta {
                    metas.push((out.units.len(), header.clone()));
                }
                out.units.push(ContentUnit {
                    name: region.name.clone(),
                    title_id: header.title_id,
                    version: 0,
                    unit_type: unit_type_of(&header),
                    header_region: idx,
                    body_region: container.body_of(idx),
                });
            }
            Err(e) => {
                tracing::debug!(region = %region.name, error = %e, "unit left unclassified");
                out.failures.push(e);
            }
        }
    }

    if policy == CnmtPolicy::Always {
        for (unit_idx, header) in &metas {
            let unit = &out.units[*unit_idx];
            match read_cnmt(container, &mut file, unit, header) {
                Ok(Some(cnmt)) => {
                    out.units[*unit_idx].unit_type = meta_unit_type(cnmt.meta_type);
                    out.cnmt = Some(cnmt);
                    break;
                }
                Ok(None) => {}
                Err(e) => out.failures.push(e),
            }
        }
        if let Some(cnmt) = &out.cnmt {
            for unit in &mut out.units {
                unit.version = cnmt.version;
                if nca_id_of(&unit.name).is_some_and(|id| cnmt.is_delta_fragment(&id)) {
                    unit.unit_type = UnitType::DeltaFragment;
                }
            }
        }
    }
    Ok(out)
}

/// Read the CNMT from a meta unit whose first section is an unencrypted PFS0.
fn read_cnmt(container: &Container, file: &mut File, unit: &ContentUnit, header: &NcaHeader) -> Result<Option<Cnmt>> {
    let Some(section) = header.sections.first().filter(|s| s.is_plain_pfs0()) else {
        return Ok(None);
    };
    let entry_offset = container.regions[unit.header_region].offset;
    let entry_end = container
        .regions
        .get(unit.header_region)
        .and_then(|r| r.entry)
        .and_then(|e| container.entries.get(e))
        .map(|e| e.offset + e.length)
        .unwrap_or(container.size);

    let unrecognized = |offset: u64, message: String| NszError::UnrecognizedMetadata {
        path: container.path.clone(),
        field: format!("{} cnmt @ {offset:#x}", unit.name),
        message,
    };

    let pfs0_at = entry_offset
        .checked_add(section.offset)
        .and_then(|o| o.checked_add(section.pfs0_offset))
        .filter(|&o| o < entry_end)
        .ok_or_else(|| unrecognized(entry_offset, "meta PFS0 lies outside the unit".into()))?;
    file.seek(SeekFrom::Start(pfs0_at)).map_err(|e| NszError::io(&container.path, e))?;
    let pfs0 = Pfs0Header::read(BufReader::new(&mut *file), pfs0_at)
        .map_err(|e| unrecognized(pfs0_at, e.to_string()))?;
    let Some(entry) = pfs0.find(|n| n.ends_with(".cnmt")) else {
        return Ok(None);
    };
    let at = pfs0_at
        .checked_add(pfs0.header_size)
        .and_then(|o| o.checked_add(entry.offset))
        .ok_or_else(|| unrecognized(pfs0_at, "CNMT offset overflows".into()))?;
    if entry.size > MAX_CNMT_SIZE || at.checked_add(entry.size).map_or(true, |end| end > entry_end) {
        return Err(unrecognized(at, format!("implausible CNMT size {}", entry.size)));
    }
    let mut data = vec![0u8; entry.size as usize];
    file.seek(SeekFrom::Start(at))
        .and_then(|_| file.read_exact(&mut data))
        .map_err(|e| NszError::io(&container.path, e))?;
    Cnmt::parse(&data).map(Some).map_err(|e| unrecognized(at, e.to_string()))
}

// ── File identity (dedup input) ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    FileName,
    ContentHeader,
    Cnmt,
    ArchiveIndex,
}

/// What a whole file represents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIdentity {
    pub path:          PathBuf,
    pub title_id:      u64,
    pub version:       u32,
    pub unit_type:     UnitType,
    /// Uncompressed size of the container the file holds or expands to.
    pub original_size: u64,
    pub source:        IdentitySource,
}

fn title_tag() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([0-9A-Fa-f]{16})\]").ok()).as_ref()
}

fn version_tag() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[vV](\d+)\]").ok()).as_ref()
}

/// `[0100000000001000]` and `[v65536]` tags from a file name.
pub fn parse_name_tags(path: &Path) -> Option<(u64, Option<u32>)> {
    let name = path.file_name()?.to_str()?;
    let title = title_tag()?.captures(name)?;
    let title_id = u64::from_str_radix(&title[1], 16).ok()?;
    let version = version_tag()
        .and_then(|re| re.captures(name))
        .and_then(|c| c[1].parse().ok());
    Some((title_id, version))
}

/// Identify a container or archive for deduplication.
pub fn identify(path: &Path, policy: CnmtPolicy, key: Option<&HeaderKey>) -> Result<FileIdentity> {
    let kind = FileKind::require(path)?;
    let tags = parse_name_tags(path);

    if policy != CnmtPolicy::Always {
        if let Some((title_id, version)) = tags {
            let original_size = match kind {
                FileKind::Archive(_) => Archive::open(path)?.source_size(),
                FileKind::Container(_) => std::fs::metadata(path).map_err(|e| NszError::io(path, e))?.len(),
            };
            return Ok(FileIdentity {
                path: path.to_owned(),
                title_id,
                version: version.unwrap_or(0),
                unit_type: UnitType::from_title_id(title_id),
                original_size,
                source: IdentitySource::FileName,
            });
        }
    }
    if policy == CnmtPolicy::Never {
        return Err(NszError::UnrecognizedMetadata {
            path: path.to_owned(),
            field: "file name".into(),
            message: "no [titleid] tag and content parsing is disabled".into(),
        });
    }

    let (units, cnmt_version, original_size, source) = match kind {
        FileKind::Archive(_) => {
            let archive = Archive::open(path)?;
            (archive.units(), None, archive.source_size(), IdentitySource::ArchiveIndex)
        }
        FileKind::Container(_) => {
            let container = Container::open(path)?;
            let c = classify_container(&container, policy, key)?;
            let source = if c.cnmt.is_some() { IdentitySource::Cnmt } else { IdentitySource::ContentHeader };
            let v = c.cnmt.as_ref().map(|m| (m.title_id, m.version));
            (c.units, v, container.size, source)
        }
    };

    let primary = Classification { units, ..Default::default() }.primary().cloned();
    let (title_id, version, unit_type) = match (cnmt_version, primary, tags) {
        (Some((tid, ver)), p, _) => (tid, ver, p.map(|u| u.unit_type).unwrap_or(UnitType::from_title_id(tid))),
        (None, Some(u), t) => (u.title_id, t.and_then(|t| t.1).unwrap_or(u.version), u.unit_type),
        (None, None, Some((tid, ver))) => (tid, ver.unwrap_or(0), UnitType::from_title_id(tid)),
        (None, None, None) => {
            return Err(NszError::UnrecognizedMetadata {
                path: path.to_owned(),
                field: "content units".into(),
                message: "no classifiable content unit".into(),
            })
        }
    };
    Ok(FileIdentity { path: path.to_owned(), title_id, version, unit_type, original_size, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_id_low_bits_pick_program_update_or_addon() {
        assert_eq!(UnitType::from_title_id(0x0100_0000_0000_1000), UnitType::Program);
        assert_eq!(UnitType::from_title_id(0x0100_0000_0000_1800), UnitType::Update);
        assert_eq!(UnitType::from_title_id(0x0100_0000_0000_1001), UnitType::AddOnContent);
    }

    #[test]
    fn name_tags_are_parsed() {
        let p = Path::new("/x/Game [0100ABCD00010000][v131072].nsz");
        assert_eq!(parse_name_tags(p), Some((0x0100_ABCD_0001_0000, Some(131072))));
        assert_eq!(parse_name_tags(Path::new("Game [0100ABCD00010000].nsp")), Some((0x0100_ABCD_0001_0000, None)));
        assert_eq!(parse_name_tags(Path::new("Game.nsp")), None);
    }

    #[test]
    fn nca_ids_come_from_32_hex_names() {
        let id = "0123456789abcdef0123456789ABCDEF";
        assert_eq!(nca_id_of(&format!("secure/{id}.nca")), Some(id.to_ascii_lowercase()));
        assert_eq!(nca_id_of(&format!("{id}.cnmt.nca")), Some(id.to_ascii_lowercase()));
        assert_eq!(nca_id_of("short.nca"), None);
    }

    #[test]
    fn encrypted_header_without_key_is_unrecognized() {
        let raw = vec![0x33u8; NCA_HEADER_SIZE];
        let err = decode_header(Path::new("a.nsp"), "x.nca", &raw, None).unwrap_err();
        assert!(matches!(err, NszError::UnrecognizedMetadata { .. }));
    }

    #[test]
    fn encrypted_header_with_key_decodes() {
        let header = NcaHeader {
            magic: *b"NCA3",
            content_type: NcaContentType::Control,
            content_size: 0x1000,
            title_id: 0x0100_0000_0000_2000,
            sdk_version: 0,
            rights_id: [0; 16],
            sections: Vec::new(),
        };
        let key = HeaderKey([0x42; 32]);
        let raw = crypto::encrypt_header(&header.to_bytes(), &key.0).unwrap();
        let decoded = decode_header(Path::new("a.nsp"), "x.nca", &raw, Some(&key)).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(unit_type_of(&decoded), UnitType::Control);
    }

    fn meta_nsp_with_pfs0_offset(pfs0_offset: u64) -> Vec<u8> {
        use crate::container::nca::{NcaSection, CRYPTO_NONE, FS_TYPE_PFS0, UNCOMPRESSABLE_HEADER_SIZE};
        use crate::container::pfs0;

        let size = 0x200u64;
        let total = UNCOMPRESSABLE_HEADER_SIZE + size;
        let header = NcaHeader {
            magic: *b"NCA3",
            content_type: NcaContentType::Meta,
            content_size: total,
            title_id: 0x0100_0000_0000_1000,
            sdk_version: 0,
            rights_id: [0; 16],
            sections: vec![NcaSection {
                index: 0,
                offset: UNCOMPRESSABLE_HEADER_SIZE,
                size,
                fs_type: FS_TYPE_PFS0,
                crypto_type: CRYPTO_NONE,
                pfs0_offset,
                pfs0_size: 0x100,
            }],
        };
        let mut meta = header.to_bytes();
        meta.resize(total as usize, 0);
        pfs0::encode(&[("0123456789abcdef0123456789abcdef.cnmt.nca".to_string(), meta)], pfs0::LEGACY_ALIGN)
    }

    #[test]
    fn overflowing_cnmt_location_is_unrecognized() {
        let dir = tempfile::tempdir().unwrap();
        for offset in [u64::MAX - 0x1000, u64::MAX] {
            let path = dir.path().join("meta.nsp");
            std::fs::write(&path, meta_nsp_with_pfs0_offset(offset)).unwrap();
            let container = Container::open(&path).unwrap();
            let c = classify_container(&container, CnmtPolicy::Always, None).unwrap();
            assert!(c.cnmt.is_none());
            assert_eq!(c.units.len(), 1);
            assert!(matches!(c.failures.as_slice(), [NszError::UnrecognizedMetadata { .. }]), "{:?}", c.failures);
        }
    }
}
