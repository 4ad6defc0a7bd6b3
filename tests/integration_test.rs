mod common;

use std::fs;
use std::path::{Path, PathBuf};

use common::*;
use nsz::config::{TieBreak, Threads};
use nsz::container::nca::NcaContentType;
use nsz::block::encode_block;
use nsz::codec::ZstdCodec;
use nsz::dedup::SupersedeReason;
use nsz::index::ArchiveIndex;
use nsz::superblock::Superblock;
use nsz::{
    Archive, CnmtPolicy, CodecParams, CompressOptions, CreateOptions, DecompressOptions, NszError, Parallelism,
    RetentionPolicy, UndupeAction, UndupePolicy, UnitType, VerifyMode, VerifyOptions, VerifyPolicy,
};
use tempfile::TempDir;

fn opts(level: i32, bse: u8, solid: bool, fix_padding: bool) -> CompressOptions {
    CompressOptions {
        params: CodecParams { level, block_size_exponent: bse, solid, long_distance_mode: solid },
        parallelism: Parallelism { multi: 1, threads: Threads::Fixed(2) },
        fix_padding,
        ..Default::default()
    }
}

fn decompress_opts(fix_padding: bool) -> DecompressOptions {
    DecompressOptions { fix_padding, ..Default::default() }
}

fn full_verify() -> VerifyOptions {
    VerifyOptions { mode: VerifyMode::Full, ..Default::default() }
}

/// Re-encode an archive's trailer after `edit` has changed its index.
fn rewrite_index(path: &Path, edit: impl FnOnce(&mut ArchiveIndex)) {
    let mut index = Archive::open(path).unwrap().index().clone();
    edit(&mut index);
    let mut bytes = fs::read(path).unwrap();
    let mut sb = Superblock::read(&bytes[..]).unwrap();
    let trailer = encode_block(&index.to_bytes().unwrap(), &ZstdCodec::new(3, false), false).unwrap();
    bytes.truncate(sb.trailer_offset as usize);
    trailer.write(&mut bytes).unwrap();
    sb.trailer_size = trailer.disk_len();
    let mut head = Vec::new();
    sb.write(&mut head).unwrap();
    bytes[..head.len()].copy_from_slice(&head);
    fs::write(path, bytes).unwrap();
}

/// Compress `source`, expand the archive into a fresh directory and return
/// (archive, restored) paths.
fn roundtrip(dir: &TempDir, source: &Path, opts: &CompressOptions) -> (PathBuf, PathBuf) {
    let outcome = nsz::compress(source, None, opts).unwrap();
    assert!(!outcome.skipped);
    let restore_dir = dir.path().join(format!("restored-{}", opts.params.solid as u8 + 2 * opts.fix_padding as u8));
    fs::create_dir_all(&restore_dir).unwrap();
    let back = nsz::decompress(&outcome.output, Some(&restore_dir), &decompress_opts(opts.fix_padding)).unwrap();
    assert_eq!(fs::read(&back.output).unwrap(), fs::read(source).unwrap());
    (outcome.output, back.output)
}

#[test]
fn test_nsp_roundtrip_all_modes() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x30000)));
    for solid in [false, true] {
        for fix_padding in [false, true] {
            let (archive, _) = roundtrip(&dir, &source, &CompressOptions { overwrite: true, ..opts(3, 14, solid, fix_padding) });
            assert_eq!(archive.extension().unwrap(), "nsz");
            assert_eq!(Archive::open(&archive).unwrap().is_solid(), solid);
        }
    }
}

#[test]
fn test_xci_roundtrip() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.xci", &xci_image(&game_files(TITLE, 0, 0x20000)));
    for fix_padding in [false, true] {
        let (archive, _) = roundtrip(&dir, &source, &CompressOptions { overwrite: true, ..opts(3, 15, false, fix_padding) });
        assert_eq!(archive.extension().unwrap(), "xcz");
        let names: Vec<String> = Archive::open(&archive).unwrap().list().into_iter().map(|e| e.name).collect();
        assert!(names.iter().all(|n| n.starts_with("secure/")), "{names:?}");
        assert_eq!(names.len(), 3);
    }
}

#[test]
fn test_lone_nca_roundtrip() {
    let dir = TempDir::new().unwrap();
    let data = nca(NcaContentType::Program, TITLE, &text(0x12345));
    let source = write(dir.path(), &nca_name(&data, false), &data);
    let (archive, _) = roundtrip(&dir, &source, &opts(5, 14, false, false));
    assert_eq!(archive.extension().unwrap(), "ncz");
    let units = Archive::open(&archive).unwrap().units();
    assert_eq!(units.len(), 1);
    assert_eq!(units[0].title_id, TITLE);
}

#[test]
fn test_unit_headers_are_stored_verbatim() {
    let dir = TempDir::new().unwrap();
    let files = game_files(TITLE, 0, 0x20000);
    let source = write(dir.path(), "game.nsp", &nsp(&files));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, false)).unwrap();
    let raw = fs::read(&outcome.output).unwrap();
    // The plaintext header area of the program unit appears in the archive unchanged.
    let header = &files[0].1[..0x4000];
    assert!(raw.windows(header.len()).any(|w| w == header));
}

/// Two units with distinct headers and an identical 4 MiB body: the solid
/// long-distance stream holds the second body as a back-reference.
#[test]
fn test_solid_long_distance_finds_repeated_bodies() {
    let dir = TempDir::new().unwrap();
    let body = noise(4 << 20, 42);
    let a = nca(NcaContentType::Program, TITLE, &body);
    let b = nca(NcaContentType::Data, TITLE | 0x1000, &body);
    let independent = zstd::bulk::compress(&a, 3).unwrap().len() + zstd::bulk::compress(&b, 3).unwrap().len();
    let source = write(dir.path(), "pair.nsp", &nsp(&[(nca_name(&a, false), a), (nca_name(&b, false), b)]));

    let mut o = opts(3, 20, true, false);
    o.parallelism.threads = Threads::Fixed(1);
    let (archive, _) = roundtrip(&dir, &source, &o);
    let size = fs::metadata(&archive).unwrap().len() as f64;
    assert!(size < 0.6 * independent as f64, "archive {size} vs independent {independent}");
}

#[test]
fn test_full_verify_reports_the_corrupted_block() {
    let dir = TempDir::new().unwrap();
    let data = nca(NcaContentType::Program, TITLE, &noise(0x20000, 3));
    let source = write(dir.path(), "one.nsp", &nsp(&[(nca_name(&data, false), data)]));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, false)).unwrap();

    let index = Archive::open(&outcome.output).unwrap().index().clone();
    let blocks: Vec<_> = index.blocks().map(|l| (l.number, l.entry.clone())).collect();
    assert!(blocks.len() >= 3);
    let (target, entry) = &blocks[blocks.len() / 2];

    let mut raw = fs::read(&outcome.output).unwrap();
    let at = (entry.compressed_offset + 32 + entry.compressed_length / 2) as usize;
    raw[at] ^= 0x5A;
    fs::write(&outcome.output, &raw).unwrap();

    match nsz::verify(&outcome.output, &full_verify()) {
        Err(NszError::CorruptBlock { block, .. }) => assert_eq!(block, *target),
        other => panic!("expected a corrupt block, got {other:?}"),
    }
}

#[test]
fn test_verify_is_repeatable_and_read_only() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x40000)));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, false)).unwrap();
    let before = fs::read(&outcome.output).unwrap();

    for mode in [VerifyMode::Quick, VerifyMode::Full] {
        let o = VerifyOptions { mode, ..Default::default() };
        let first = nsz::verify(&outcome.output, &o).unwrap();
        let second = nsz::verify(&outcome.output, &o).unwrap();
        assert_eq!(first, second);
    }
    assert_eq!(fs::read(&outcome.output).unwrap(), before);

    let full = nsz::verify(&outcome.output, &full_verify()).unwrap();
    assert_eq!(full.compared_with.as_deref(), Some(source.as_path()));
    assert_eq!(full.nca_hashes, 2);
}

#[test]
fn test_full_verify_detects_a_different_original() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x20000)));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, false)).unwrap();

    let mut other = fs::read(&source).unwrap();
    let last = other.len() - 1;
    other[last] ^= 1;
    let other_path = write(dir.path(), "other.nsp", &other);
    let o = VerifyOptions { original: Some(other_path), ..full_verify() };
    match nsz::verify(&outcome.output, &o) {
        Err(NszError::VerificationFailed { offset, .. }) => assert_eq!(offset, Some(last as u64)),
        other => panic!("expected a verification failure, got {other:?}"),
    }
}

#[test]
fn test_failed_post_compress_verify_publishes_nothing() {
    let dir = TempDir::new().unwrap();
    let program = nca(NcaContentType::Program, TITLE, &text(0x10000));
    let misnamed = "0123456789abcdef0123456789abcdef.nca".to_string();
    let source = write(dir.path(), "game.nsp", &nsp(&[(misnamed, program)]));
    let output = dir.path().join("game.nsz");
    fs::write(&output, b"earlier output").unwrap();

    let o = CompressOptions {
        verify: VerifyPolicy::Full,
        retention: RetentionPolicy::RemoveSource,
        overwrite: true,
        ..opts(3, 14, false, false)
    };
    assert!(matches!(nsz::compress(&source, None, &o), Err(NszError::VerificationFailed { .. })));
    assert_eq!(fs::read(&output).unwrap(), b"earlier output");
    assert!(!dir.path().join("game.nsz.part").exists());
    assert!(source.exists());
}

#[test]
fn test_wrong_stored_checksum_is_reported() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x20000)));
    for solid in [false, true] {
        let outcome = nsz::compress(&source, None, &CompressOptions { overwrite: true, ..opts(3, 14, solid, false) }).unwrap();
        rewrite_index(&outcome.output, |index| index.checksum = "00".repeat(32));

        let restore_dir = dir.path().join(format!("restore-{solid}"));
        fs::create_dir_all(&restore_dir).unwrap();
        match nsz::decompress(&outcome.output, Some(&restore_dir), &decompress_opts(false)) {
            Err(NszError::ChecksumMismatch { expected, actual, .. }) => {
                assert_eq!(expected, "00".repeat(32));
                assert_ne!(actual, expected);
            }
            other => panic!("expected a checksum mismatch, got {other:?}"),
        }
        assert!(!restore_dir.join("game.nsp").exists());
    }
}

#[test]
fn test_tampered_padding_record_is_a_padding_mismatch() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x20000)));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, true)).unwrap();
    let mut padded = String::new();
    rewrite_index(&outcome.output, |index| {
        let region = index.regions.iter_mut().find(|r| r.padding.is_some()).unwrap();
        region.padding.as_mut().unwrap().fill = 0x11;
        padded = region.name.clone();
    });

    let restore_dir = dir.path().join("restore");
    fs::create_dir_all(&restore_dir).unwrap();
    match nsz::decompress(&outcome.output, Some(&restore_dir), &decompress_opts(true)) {
        Err(NszError::PaddingMismatch { region, .. }) => assert_eq!(region, padded),
        other => panic!("expected a padding mismatch, got {other:?}"),
    }
    let quick = VerifyOptions { fix_padding: true, ..Default::default() };
    assert!(matches!(nsz::verify(&outcome.output, &quick), Err(NszError::PaddingMismatch { .. })));

    // Lenient decode regenerates the wrong filler and the checksum catches it.
    assert!(matches!(
        nsz::decompress(&outcome.output, Some(&restore_dir), &decompress_opts(false)),
        Err(NszError::ChecksumMismatch { .. })
    ));
}

#[test]
fn test_quick_verify_catches_each_sampled_block() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x30000)));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, false)).unwrap();
    let pristine = fs::read(&outcome.output).unwrap();
    let index = Archive::open(&outcome.output).unwrap().index().clone();
    let count = index.block_count();
    assert!(count >= 3);

    let quick = VerifyOptions { mode: VerifyMode::Quick, ..Default::default() };
    assert_eq!(nsz::verify(&outcome.output, &quick).unwrap().blocks_checked, 3);

    for pick in [0, count / 2, count - 1] {
        let entry = index.blocks().find(|b| b.number == pick).unwrap().entry.clone();
        let mut bytes = pristine.clone();
        bytes[(entry.compressed_offset + 32 + entry.compressed_length / 2) as usize] ^= 0x40;
        fs::write(&outcome.output, &bytes).unwrap();
        match nsz::verify(&outcome.output, &quick) {
            Err(NszError::CorruptBlock { block, .. }) => assert_eq!(block, pick),
            other => panic!("block {pick}: expected corruption, got {other:?}"),
        }
    }
}

#[test]
fn test_padding_normalisation_shrinks_the_archive() {
    let dir = TempDir::new().unwrap();
    let mut body = noise(0x30000, 9);
    body.extend(std::iter::repeat(0u8).take(1 << 20));
    let data = nca(NcaContentType::Program, TITLE, &body);
    let name = nca_name(&data, false);
    let plain = write(dir.path(), "plain.nsp", &nsp(&[(name.clone(), data.clone())]));
    let fixed = write(dir.path(), "fixed.nsp", &nsp(&[(name, data)]));

    let (a, _) = roundtrip(&dir, &plain, &opts(3, 14, false, false));
    let (b, _) = roundtrip(&dir, &fixed, &opts(3, 14, false, true));
    let without = fs::metadata(a).unwrap().len();
    let with = fs::metadata(&b).unwrap().len();
    assert!(with < without, "with padding records {with}, without {without}");
    assert!(Archive::open(&b).unwrap().index().regions.iter().any(|r| r.padding.is_some()));
}

#[test]
fn test_extract_from_container_and_archive() {
    let dir = TempDir::new().unwrap();
    let files = game_files(TITLE, 0, 0x20000);
    let source = write(dir.path(), "game.nsp", &nsp(&files));
    let outcome = nsz::compress(&source, None, &opts(3, 14, true, false)).unwrap();
    let cancel = nsz::CancelToken::new();

    for src in [&source, &outcome.output] {
        let out_dir = dir.path().join(format!("x-{}", src.extension().unwrap().to_string_lossy()));
        let report = nsz::extract(&[src.clone()], &out_dir, r"\.tik$", &cancel).unwrap();
        let written = report.outcomes[0].1.as_ref().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(fs::read(&written[0]).unwrap(), files[2].1);

        let none = nsz::extract(&[src.clone()], &out_dir, "no-such-entry", &cancel).unwrap();
        assert!(none.outcomes[0].1.as_ref().unwrap().is_empty());
    }
}

#[test]
fn test_create_then_extract() {
    let dir = TempDir::new().unwrap();
    let loose: Vec<PathBuf> = game_files(TITLE, 0, 0x8000)
        .into_iter()
        .map(|(name, data)| write(dir.path(), &name, &data))
        .collect();
    let output = dir.path().join("packed.nsp");
    nsz::create(&output, &loose, &CreateOptions { fix_padding: true, overwrite: false }).unwrap();

    let report = nsz::extract(&[output.clone()], &dir.path().join("out"), ".", &nsz::CancelToken::new()).unwrap();
    let written = report.outcomes[0].1.as_ref().unwrap();
    assert_eq!(written.len(), loose.len());
    for (orig, copy) in loose.iter().zip(written) {
        assert_eq!(orig.file_name(), copy.file_name());
        assert_eq!(fs::read(orig).unwrap(), fs::read(copy).unwrap());
    }
    assert!(nsz::create(&output, &loose, &CreateOptions::default()).is_err());
}

#[test]
fn test_extract_streams_padded_entries_from_block_archive() {
    let dir = TempDir::new().unwrap();
    let files = game_files(TITLE, 0, 0x30000);
    let source = write(dir.path(), "game.nsp", &nsp(&files));
    let outcome = nsz::compress(&source, None, &opts(3, 14, false, true)).unwrap();
    let mut archive = Archive::open(&outcome.output).unwrap();
    assert!(!archive.is_solid());
    assert!(archive.index().regions.iter().any(|r| r.padding.is_some()));

    let out_dir = dir.path().join("out");
    let written = archive.extract(&regex::Regex::new(".").unwrap(), &out_dir, &nsz::CancelToken::new()).unwrap();
    assert_eq!(written.len(), files.len());
    for (name, data) in &files {
        assert_eq!(&fs::read(out_dir.join(name)).unwrap(), data, "{name}");
    }

    let mut program = Vec::new();
    archive.read_entry_to(&files[0].0, &mut program, &nsz::CancelToken::new()).unwrap();
    assert_eq!(program, files[0].1);
}

#[test]
fn test_extract_unreadable_source_does_not_stop_the_others() {
    let dir = TempDir::new().unwrap();
    let files = game_files(TITLE, 0, 0x8000);
    let first = write(dir.path(), "first.nsp", &nsp(&files));
    let mut broken = nsp(&files);
    broken.truncate(0x20);
    let bad = write(dir.path(), "bad.nsp", &broken);
    let last = write(dir.path(), "last.nsp", &nsp(&files));
    let out_dir = dir.path().join("out");

    let report = nsz::extract(&[first, bad.clone(), last], &out_dir, r"\.tik$", &nsz::CancelToken::new()).unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.succeeded().count(), 2);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, bad.as_path());
    assert!(matches!(failed[0].1, NszError::MalformedContainer { .. }), "{:?}", failed[0].1);
    for stem in ["first", "last"] {
        assert_eq!(fs::read(out_dir.join(stem).join(&files[2].0)).unwrap(), files[2].1);
    }

    assert!(matches!(
        nsz::extract(&[bad], &out_dir, "(", &nsz::CancelToken::new()),
        Err(NszError::InvalidParameter { .. })
    ));
}

#[test]
fn test_classify_reads_version_and_delta_fragments() {
    let dir = TempDir::new().unwrap();
    let game = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x8000)));
    let update = write(dir.path(), "update.nsp", &nsp(&update_files(TITLE, 65536)));
    let report = nsz::classify_batch(&[game, update], CnmtPolicy::Always, None, 2).unwrap();
    assert!(report.is_success());

    let units: Vec<_> = report.succeeded().map(|(_, u)| u.clone()).collect();
    assert!(units[0].iter().any(|u| u.unit_type == UnitType::Program && u.title_id == TITLE));
    assert!(units[1].iter().all(|u| u.version == 65536));
    assert_eq!(units[1].iter().filter(|u| u.unit_type == UnitType::DeltaFragment).count(), 1);
}

#[test]
fn test_existing_output_is_skipped_without_overwrite() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x8000)));
    let first = nsz::compress(&source, None, &opts(3, 14, false, false)).unwrap();
    let stamp = fs::read(&first.output).unwrap();
    let second = nsz::compress(&source, None, &opts(3, 14, true, false)).unwrap();
    assert!(second.skipped);
    assert_eq!(fs::read(&first.output).unwrap(), stamp);
}

#[test]
fn test_remove_source_after_verification() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x8000)));
    let o = CompressOptions { verify: VerifyPolicy::Full, retention: RetentionPolicy::RemoveSource, ..opts(3, 14, false, false) };
    let outcome = nsz::compress(&source, None, &o).unwrap();
    assert!(outcome.source_removed);
    assert_eq!(outcome.verify.as_ref().unwrap().path, outcome.output);
    assert!(!source.exists());

    let without_verify = CompressOptions { retention: RetentionPolicy::RemoveSource, ..opts(3, 14, false, false) };
    assert!(matches!(
        nsz::compress(&outcome.output, None, &without_verify),
        Err(NszError::InvalidParameter { name: "retention", .. })
    ));
}

#[test]
fn test_cancelled_compress_leaves_nothing_behind() {
    let dir = TempDir::new().unwrap();
    let source = write(dir.path(), "game.nsp", &nsp(&game_files(TITLE, 0, 0x20000)));
    let o = opts(3, 14, false, false);
    o.cancel.cancel();
    assert!(matches!(nsz::compress(&source, None, &o), Err(NszError::Cancelled { .. })));
    let left: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name()).collect();
    assert_eq!(left, vec![std::ffi::OsString::from("game.nsp")]);
}

#[test]
fn test_batch_reports_each_file() {
    let dir = TempDir::new().unwrap();
    let good = write(dir.path(), "good.nsp", &nsp(&game_files(TITLE, 0, 0x8000)));
    let bad = write(dir.path(), "bad.nsp", b"not a container");
    let o = CompressOptions { parallelism: Parallelism { multi: 2, threads: Threads::Fixed(1) }, ..opts(3, 14, false, false) };
    let report = nsz::compress_batch(&[good, bad.clone()], None, &o).unwrap();
    assert!(!report.is_success());
    assert_eq!(report.succeeded().count(), 1);
    let failed: Vec<_> = report.failed().map(|(p, _)| p.to_owned()).collect();
    assert_eq!(failed, vec![bad]);
}

// ── Deduplication ────────────────────────────────────────────────────────────

const TAGGED: &str = "Game [0100000000010000][v0]";

fn tagged_pair(dir: &TempDir) -> (PathBuf, PathBuf) {
    let small = write(dir.path(), &format!("{TAGGED}.nsp"), &nsp(&game_files(TITLE, 0, 0x8000)));
    let big = write(dir.path(), &format!("{TAGGED} (bad).nsp"), &nsp(&game_files(TITLE, 0, 0x10000)));
    (small, big)
}

#[test]
fn test_undupe_blacklist_supersedes_the_larger_copy() {
    let dir = TempDir::new().unwrap();
    let (small, big) = tagged_pair(&dir);
    let policy = UndupePolicy { blacklist: vec![r"\(bad\)".into()], action: UndupeAction::Remove, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), big.clone()], &policy).unwrap();

    assert_eq!(report.kept, vec![small.clone()]);
    assert_eq!(report.superseded.len(), 1);
    assert_eq!(report.superseded[0].path, big);
    assert_eq!(report.superseded[0].reason, SupersedeReason::Blacklisted);
    assert!(report.superseded[0].applied);
    assert!(small.exists() && !big.exists());
}

#[test]
fn test_undupe_dry_run_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let (small, big) = tagged_pair(&dir);
    let policy = UndupePolicy { action: UndupeAction::Remove, dry_run: true, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), big.clone()], &policy).unwrap();
    assert!(report.dry_run);
    assert_eq!(report.superseded.len(), 1);
    assert_eq!(report.superseded[0].path, small);
    assert!(!report.superseded[0].applied);
    assert!(small.exists() && big.exists());
}

#[test]
fn test_undupe_is_independent_of_input_order() {
    let dir = TempDir::new().unwrap();
    let (small, big) = tagged_pair(&dir);
    let third = write(dir.path(), &format!("{TAGGED} copy.nsp"), &fs::read(&small).unwrap());
    let policy = UndupePolicy { dry_run: true, tie_break: TieBreak::PathOrder, ..Default::default() };

    let forward = nsz::undupe(&[small.clone(), big.clone(), third.clone()], &policy).unwrap();
    let backward = nsz::undupe(&[third, big, small], &policy).unwrap();
    assert_eq!(forward.kept, backward.kept);
    assert_eq!(forward.superseded, backward.superseded);
}

#[test]
fn test_undupe_refuses_ambiguous_groups() {
    let dir = TempDir::new().unwrap();
    let (small, _) = tagged_pair(&dir);
    let twin = write(dir.path(), &format!("{TAGGED} twin.nsp"), &fs::read(&small).unwrap());
    let policy = UndupePolicy { action: UndupeAction::Remove, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), twin.clone()], &policy).unwrap();
    assert!(report.superseded.is_empty());
    assert!(matches!(report.ambiguous.as_slice(), [NszError::AmbiguousContent { .. }]));
    assert!(small.exists() && twin.exists());
}

#[test]
fn test_undupe_groups_versions_when_asked() {
    let dir = TempDir::new().unwrap();
    let v0 = write(dir.path(), "Game [0100000000010000][v0].nsp", &nsp(&game_files(TITLE, 0, 0x10000)));
    let v1 = write(dir.path(), "Game [0100000000010000][v65536].nsp", &nsp(&game_files(TITLE, 65536, 0x8000)));

    let separate = nsz::undupe(&[v0.clone(), v1.clone()], &UndupePolicy { dry_run: true, ..Default::default() }).unwrap();
    assert!(separate.superseded.is_empty());

    let merged = UndupePolicy { old_versions: true, dry_run: true, ..Default::default() };
    let report = nsz::undupe(&[v0.clone(), v1.clone()], &merged).unwrap();
    assert_eq!(report.kept, vec![v1]);
    assert_eq!(report.superseded[0].path, v0);
    assert_eq!(report.superseded[0].reason, SupersedeReason::Outranked);
}

#[cfg(unix)]
#[test]
fn test_undupe_hardlink_shares_the_inode() {
    use std::os::unix::fs::MetadataExt;

    let dir = TempDir::new().unwrap();
    let (small, big) = tagged_pair(&dir);
    let policy = UndupePolicy { action: UndupeAction::Hardlink, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), big.clone()], &policy).unwrap();
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert!(report.superseded[0].applied);
    assert_eq!(fs::metadata(&small).unwrap().ino(), fs::metadata(&big).unwrap().ino());
    assert_eq!(fs::read(&small).unwrap(), fs::read(&big).unwrap());
}

#[test]
fn test_undupe_sees_through_archives() {
    let dir = TempDir::new().unwrap();
    let (small, _) = tagged_pair(&dir);
    let archive_dir = dir.path().join("compressed");
    fs::create_dir_all(&archive_dir).unwrap();
    let outcome = nsz::compress(&small, Some(&archive_dir), &opts(3, 14, false, false)).unwrap();

    let policy = UndupePolicy { dry_run: true, tie_break: TieBreak::PathOrder, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), outcome.output.clone()], &policy).unwrap();
    // Same title, version and original size; path order decides.
    assert_eq!(report.superseded.len(), 1);
    let mut expected = vec![small, outcome.output];
    expected.sort();
    assert_eq!(report.kept, vec![expected[0].clone()]);
}

#[test]
fn test_undupe_failed_link_leaves_the_copy_and_reports() {
    let dir = TempDir::new().unwrap();
    let (small, big) = tagged_pair(&dir);
    let original = fs::read(&small).unwrap();
    let staging = small.with_file_name(format!(".{}.link", small.file_name().unwrap().to_string_lossy()));
    fs::write(&staging, b"occupied").unwrap();

    let policy = UndupePolicy { action: UndupeAction::Hardlink, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), big.clone()], &policy).unwrap();
    assert_eq!(report.superseded.len(), 1);
    let entry = &report.superseded[0];
    assert_eq!(entry.path, small);
    assert!(!entry.applied);
    assert_eq!(entry.note.as_deref(), Some("link failed; reported only"));
    assert!(matches!(report.failures.as_slice(), [NszError::LinkFailed { path, target, .. }] if *path == small && *target == big));
    assert_eq!(fs::read(&small).unwrap(), original);
    assert_eq!(fs::read(&staging).unwrap(), b"occupied");
}

#[test]
fn test_undupe_flags_blacklisted_copy_in_an_ambiguous_group() {
    let dir = TempDir::new().unwrap();
    let (small, big) = tagged_pair(&dir);
    let twin = write(dir.path(), &format!("{TAGGED} twin.nsp"), &fs::read(&small).unwrap());
    let policy = UndupePolicy { blacklist: vec![r"\(bad\)".into()], action: UndupeAction::Remove, ..Default::default() };
    let report = nsz::undupe(&[small.clone(), twin.clone(), big.clone()], &policy).unwrap();

    assert!(matches!(report.ambiguous.as_slice(), [NszError::AmbiguousContent { .. }]));
    assert_eq!(report.superseded.len(), 1);
    assert_eq!(report.superseded[0].path, big);
    assert_eq!(report.superseded[0].reason, SupersedeReason::Blacklisted);
    assert!(report.superseded[0].applied);
    assert!(report.kept.contains(&small) && report.kept.contains(&twin));
    assert!(small.exists() && twin.exists() && !big.exists());
}
