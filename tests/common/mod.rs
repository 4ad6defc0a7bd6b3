//! Synthetic containers for integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use nsz::classify::cnmt::{Cnmt, CnmtContent, MetaType, CONTENT_DELTA_FRAGMENT};
use nsz::container::nca::{NcaContentType, NcaHeader, NcaSection, CRYPTO_NONE, FS_TYPE_PFS0, MEDIA_UNIT, UNCOMPRESSABLE_HEADER_SIZE};
use nsz::container::{hfs0, pfs0, xci};
use sha2::{Digest, Sha256};

pub const TITLE: u64 = 0x0100_0000_0001_0000;

/// Deterministic incompressible bytes.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}

/// Compressible but not trivial bytes.
pub fn text(len: usize) -> Vec<u8> {
    let words = [&b"switch "[..], b"content ", b"archive ", b"block ", b"zstd ", b"title "];
    let mut out = Vec::with_capacity(len);
    let mut i = 0usize;
    while out.len() < len {
        out.extend_from_slice(words[(i * 7 + i / 3) % words.len()]);
        i += 1;
    }
    out.truncate(len);
    out
}

/// A plaintext NCA: header area padded to 0x4000, then `body`.
pub fn nca(content_type: NcaContentType, title_id: u64, body: &[u8]) -> Vec<u8> {
    let total = UNCOMPRESSABLE_HEADER_SIZE + body.len() as u64;
    let header = NcaHeader {
        magic: *b"NCA3",
        content_type,
        content_size: total,
        title_id,
        sdk_version: 0x000C_1100,
        rights_id: [0; 16],
        sections: Vec::new(),
    };
    let mut out = header.to_bytes();
    out.resize(UNCOMPRESSABLE_HEADER_SIZE as usize, 0);
    out.extend_from_slice(body);
    out
}

/// A meta NCA whose first section is a plain PFS0 holding `cnmt`.
pub fn meta_nca(title_id: u64, cnmt: &Cnmt) -> Vec<u8> {
    let inner = pfs0::encode(&[("Application_0100000000010000.cnmt".to_string(), cnmt.to_bytes())], pfs0::LEGACY_ALIGN);
    let section_offset = UNCOMPRESSABLE_HEADER_SIZE;
    let section_size = (inner.len() as u64).div_ceil(MEDIA_UNIT) * MEDIA_UNIT;
    let total = section_offset + section_size;
    let header = NcaHeader {
        magic: *b"NCA3",
        content_type: NcaContentType::Meta,
        content_size: total,
        title_id,
        sdk_version: 0,
        rights_id: [0; 16],
        sections: vec![NcaSection {
            index: 0,
            offset: section_offset,
            size: section_size,
            fs_type: FS_TYPE_PFS0,
            crypto_type: CRYPTO_NONE,
            pfs0_offset: 0,
            pfs0_size: inner.len() as u64,
        }],
    };
    let mut out = header.to_bytes();
    out.resize(section_offset as usize, 0);
    out.extend_from_slice(&inner);
    out.resize(total as usize, 0);
    out
}

/// `<content id>.nca`, the id being the first half of the SHA-256.
pub fn nca_name(data: &[u8], meta: bool) -> String {
    let id = hex::encode(&Sha256::digest(data)[..16]);
    if meta { format!("{id}.cnmt.nca") } else { format!("{id}.nca") }
}

pub fn nca_id(data: &[u8]) -> [u8; 16] {
    let mut id = [0u8; 16];
    id.copy_from_slice(&Sha256::digest(data)[..16]);
    id
}

pub fn nsp(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    pfs0::encode(files, pfs0::LEGACY_ALIGN)
}

/// Gamecard image: card header, root HFS0 with a `secure` partition.
pub fn xci_image(files: &[(String, Vec<u8>)]) -> Vec<u8> {
    let sizes: Vec<(String, u64)> = files.iter().map(|(n, d)| (n.clone(), d.len() as u64)).collect();
    let mut secure = hfs0::encode_header(&sizes);
    for (_, d) in files {
        secure.extend_from_slice(d);
    }
    secure.resize((secure.len() as u64).div_ceil(MEDIA_UNIT) as usize * MEDIA_UNIT as usize, 0);

    let root_header = hfs0::encode_header(&[("secure".to_string(), secure.len() as u64)]);
    let mut out = xci::encode_header(0x200, root_header.len() as u64);
    out.extend_from_slice(&root_header);
    out.extend_from_slice(&secure);
    out
}

pub fn write(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

/// A small game: a program NCA with trailing zero padding, a meta NCA with
/// the CNMT, and a ticket.
pub fn game_files(title_id: u64, version: u32, body_len: usize) -> Vec<(String, Vec<u8>)> {
    let mut body = text(body_len);
    body.extend(std::iter::repeat(0u8).take(0x8000));
    let program = nca(NcaContentType::Program, title_id, &body);
    let cnmt = Cnmt {
        title_id,
        version,
        meta_type: MetaType::Application,
        contents: vec![CnmtContent {
            hash: [0; 32],
            nca_id: nca_id(&program),
            size: program.len() as u64,
            content_type: 1,
        }],
    };
    let meta = meta_nca(title_id, &cnmt);
    vec![
        (nca_name(&program, false), program),
        (nca_name(&meta, true), meta),
        (format!("{title_id:016x}0000000000000000.tik"), noise(0x2C0, title_id)),
    ]
}

/// An update with one delta fragment listed in its CNMT.
pub fn update_files(title_id: u64, version: u32) -> Vec<(String, Vec<u8>)> {
    let update_id = title_id | 0x800;
    let program = nca(NcaContentType::Program, update_id, &text(0x20000));
    let fragment = nca(NcaContentType::Data, update_id, &noise(0x10000, 7));
    let cnmt = Cnmt {
        title_id: update_id,
        version,
        meta_type: MetaType::Patch,
        contents: vec![
            CnmtContent { hash: [0; 32], nca_id: nca_id(&program), size: program.len() as u64, content_type: 1 },
            CnmtContent { hash: [0; 32], nca_id: nca_id(&fragment), size: fragment.len() as u64, content_type: CONTENT_DELTA_FRAGMENT },
        ],
    };
    let meta = meta_nca(update_id, &cnmt);
    vec![
        (nca_name(&program, false), program),
        (nca_name(&fragment, false), fragment),
        (nca_name(&meta, true), meta),
    ]
}
