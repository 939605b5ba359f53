//! Tests for the deterministic tar writer.
//!
//! Validates that layer bytes are a pure function of logical content:
//! entry ordering, mode normalization, pinned metadata, and containment
//! of paths and symlink targets.

use pyoci::{Digest, Error, LayerTarball};
use std::fs;
use std::io::Read;
use tempfile::TempDir;

fn read_entries(archive: &[u8]) -> Vec<(String, u64, u32, u64)> {
    let mut reader = tar::Archive::new(archive);
    reader
        .entries()
        .unwrap()
        .map(|e| {
            let e = e.unwrap();
            let header = e.header();
            (
                e.path().unwrap().to_string_lossy().into_owned(),
                header.mtime().unwrap(),
                header.mode().unwrap(),
                header.uid().unwrap(),
            )
        })
        .collect()
}

// =============================================================================
// Determinism Tests
// =============================================================================

#[test]
fn test_bytes_independent_of_insertion_order() {
    let build = |order: &[&str]| {
        let mut tarball = LayerTarball::new("app", Some(0));
        for path in order {
            tarball
                .add_bytes(path, format!("content of {}", path).into_bytes(), false)
                .unwrap();
        }
        let mut out = Vec::new();
        tarball.write_to(&mut out, false).unwrap();
        out
    };

    let forward = build(&["src/a.py", "src/b.py", "main.py"]);
    let backward = build(&["main.py", "src/b.py", "src/a.py"]);
    assert_eq!(forward, backward, "insertion order must not leak into bytes");
}

#[test]
fn test_filesystem_creation_order_does_not_matter() {
    let populate = |dir: &TempDir, order: &[&str]| {
        fs::create_dir(dir.path().join("src")).unwrap();
        for name in order {
            fs::write(dir.path().join("src").join(name), format!("# {}", name)).unwrap();
        }
    };

    let dir_a = TempDir::new().unwrap();
    populate(&dir_a, &["a.py", "b.py"]);
    let dir_b = TempDir::new().unwrap();
    populate(&dir_b, &["b.py", "a.py"]);

    let archive = |dir: &TempDir| {
        let mut tarball = LayerTarball::new("app", Some(0));
        // Add in whatever order read_dir yields.
        for entry in fs::read_dir(dir.path().join("src")).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            tarball
                .add_path(&format!("src/{}", name), &entry.path())
                .unwrap();
        }
        let mut out = Vec::new();
        tarball.write_to(&mut out, false).unwrap();
        out
    };

    assert_eq!(archive(&dir_a), archive(&dir_b));
}

#[test]
fn test_entries_emitted_in_lexicographic_order() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("zz.py", b"z".to_vec(), false).unwrap();
    tarball.add_bytes("aa.py", b"a".to_vec(), false).unwrap();
    tarball.add_bytes("mm/x.py", b"m".to_vec(), false).unwrap();

    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let paths: Vec<String> = read_entries(&out).into_iter().map(|(p, ..)| p).collect();
    assert_eq!(paths, vec!["app/", "app/aa.py", "app/mm/x.py", "app/zz.py"]);
}

#[test]
fn test_mtime_uid_gid_pinned() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("main.py", b"print()".to_vec(), false).unwrap();

    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    for (path, mtime, _, uid) in read_entries(&out) {
        assert_eq!(mtime, 0, "{} mtime must be epoch", path);
        assert_eq!(uid, 0, "{} uid must be 0", path);
    }
}

#[test]
fn test_reproducible_timestamp_applied() {
    let mut tarball = LayerTarball::new("app", Some(1_700_000_000));
    tarball.add_bytes("main.py", b"print()".to_vec(), false).unwrap();

    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let entries = read_entries(&out);
    assert!(entries.iter().all(|(_, mtime, ..)| *mtime == 1_700_000_000));
}

// =============================================================================
// Mode Normalization Tests
// =============================================================================

#[test]
fn test_regular_file_mode_0644() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("main.py", b"print()".to_vec(), false).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let modes: Vec<(String, u32)> = read_entries(&out)
        .into_iter()
        .map(|(p, _, mode, _)| (p, mode))
        .collect();
    assert!(modes.contains(&("app/main.py".to_string(), 0o644)));
    assert!(modes.contains(&("app/".to_string(), 0o755)));
}

#[test]
fn test_executable_bit_promotes_mode() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("run.sh", b"#!/bin/sh\n".to_vec(), true).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let entry = read_entries(&out)
        .into_iter()
        .find(|(p, ..)| p == "app/run.sh")
        .unwrap();
    assert_eq!(entry.2, 0o755);
}

#[cfg(unix)]
#[test]
fn test_shell_extension_detected_from_filesystem() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let script = dir.path().join("deploy.sh");
    fs::write(&script, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o600)).unwrap();

    let plain = dir.path().join("notes.txt");
    fs::write(&plain, "notes").unwrap();

    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_path("deploy.sh", &script).unwrap();
    tarball.add_path("notes.txt", &plain).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let entries = read_entries(&out);
    let sh = entries.iter().find(|(p, ..)| p == "app/deploy.sh").unwrap();
    let txt = entries.iter().find(|(p, ..)| p == "app/notes.txt").unwrap();
    assert_eq!(sh.2, 0o755, ".sh files are executable regardless of bits");
    assert_eq!(txt.2, 0o644);
}

// =============================================================================
// Boundary Tests
// =============================================================================

#[test]
fn test_zero_file_layer_is_stable_and_nonempty() {
    let archive = || {
        let tarball = LayerTarball::new("app", Some(0));
        let mut out = Vec::new();
        let summary = tarball.write_to(&mut out, false).unwrap();
        (out, summary)
    };

    let (first, first_summary) = archive();
    let (second, second_summary) = archive();

    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert_eq!(first_summary.diff_id, second_summary.diff_id);
    assert_eq!(read_entries(&first).len(), 1, "only the root directory entry");
}

/// Walks raw 512-byte tar blocks, returning `(typeflag, name, data)`
/// per entry. Lets assertions see extended-header entries that archive
/// readers consume silently.
fn raw_entries(archive: &[u8]) -> Vec<(u8, String, Vec<u8>)> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + 512 <= archive.len() {
        let block = &archive[offset..offset + 512];
        if block.iter().all(|&b| b == 0) {
            break;
        }
        let name = String::from_utf8_lossy(&block[0..100])
            .trim_end_matches('\0')
            .to_string();
        let size_text = String::from_utf8_lossy(&block[124..136]);
        let size = usize::from_str_radix(size_text.trim_end_matches('\0').trim(), 8).unwrap_or(0);
        let typeflag = block[156];
        let data = archive[offset + 512..offset + 512 + size].to_vec();
        out.push((typeflag, name, data));
        offset += 512 + size.div_ceil(512) * 512;
    }
    out
}

#[test]
fn test_long_path_digest_stable_across_runs() {
    // Push past the 100-byte USTAR name field.
    let long_component = "d".repeat(60);
    let path = format!("{}/{}/{}.py", long_component, long_component, "f".repeat(80));
    assert!(path.len() > 100);

    let build = || {
        let mut tarball = LayerTarball::new("app", Some(0));
        tarball.add_bytes(&path, b"x".to_vec(), false).unwrap();
        let mut out = Vec::new();
        tarball.write_to(&mut out, false).unwrap().diff_id
    };

    assert_eq!(build(), build());
}

#[test]
fn test_long_path_uses_pax_extended_header() {
    let path = format!("{}/{}.py", "d".repeat(90), "f".repeat(90));
    assert!(path.len() > 100);

    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes(&path, b"x".to_vec(), false).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let entries = raw_entries(&out);

    // No GNU longname/longlink entries anywhere.
    assert!(
        entries.iter().all(|(t, ..)| *t != b'L' && *t != b'K'),
        "GNU long-name entries must not be emitted"
    );

    // A PAX extended header (type 'x') carries the full path record,
    // length-prefixed per the PAX record format.
    let full = format!("app/{}", path);
    let record = format!("path={}\n", full);
    let pax = entries
        .iter()
        .find(|(t, ..)| *t == b'x')
        .expect("a PAX extended header entry must precede the long entry");
    let pax_text = String::from_utf8_lossy(&pax.2);
    assert!(pax_text.contains(&record), "PAX data must carry the path record");
    let expected_len = pax.2.len();
    assert!(
        pax_text.starts_with(&format!("{} ", expected_len)),
        "PAX record length must count the whole record"
    );

    // The entry itself follows with a truncated stand-in name.
    let position = entries.iter().position(|(t, ..)| *t == b'x').unwrap();
    let (typeflag, name, data) = &entries[position + 1];
    assert_eq!(*typeflag, b'0');
    assert!(name.len() <= 100);
    assert!(full.starts_with(name.as_str()));
    assert_eq!(data, b"x");
}

#[test]
fn test_long_symlink_target_uses_pax_linkpath() {
    let target = format!("{}/{}", "t".repeat(80), "u".repeat(80));
    assert!(target.len() > 100);

    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_symlink("lib/current", &target).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let entries = raw_entries(&out);
    assert!(entries.iter().all(|(t, ..)| *t != b'L' && *t != b'K'));

    let pax = entries
        .iter()
        .find(|(t, ..)| *t == b'x')
        .expect("long symlink target must be carried by a PAX header");
    let pax_text = String::from_utf8_lossy(&pax.2);
    assert!(pax_text.contains(&format!("linkpath={}\n", target)));
}

#[test]
fn test_short_paths_stay_plain_ustar() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("main.py", b"print()".to_vec(), false).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let entries = raw_entries(&out);
    assert!(
        entries.iter().all(|(t, ..)| *t != b'x' && *t != b'L'),
        "short paths need no extension entries"
    );
}

#[test]
fn test_long_path_roundtrips_through_reader() {
    let path = format!("{}/{}.py", "d".repeat(90), "f".repeat(90));
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes(&path, b"content".to_vec(), false).unwrap();
    let mut out = Vec::new();
    tarball.write_to(&mut out, false).unwrap();

    let mut reader = tar::Archive::new(out.as_slice());
    let mut found = false;
    for entry in reader.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == format!("app/{}", path) {
            let mut content = String::new();
            entry.read_to_string(&mut content).unwrap();
            assert_eq!(content, "content");
            found = true;
        }
    }
    assert!(found, "long path entry must survive a round trip");
}

// =============================================================================
// Safety Tests
// =============================================================================

#[test]
fn test_duplicate_entry_rejected() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("main.py", b"a".to_vec(), false).unwrap();
    let err = tarball.add_bytes("./main.py", b"b".to_vec(), false).unwrap_err();
    assert!(matches!(err, Error::DuplicateEntry { .. }));
}

#[test]
fn test_escaping_paths_rejected() {
    let mut tarball = LayerTarball::new("app", Some(0));
    for bad in ["../evil.py", "/etc/passwd", "a/../../evil.py", ""] {
        let err = tarball.add_bytes(bad, b"x".to_vec(), false).unwrap_err();
        assert!(
            matches!(err, Error::UnsafePath { .. }),
            "{:?} should be rejected",
            bad
        );
    }
}

#[test]
fn test_symlink_targets_contained() {
    let mut tarball = LayerTarball::new("app", Some(0));

    // Within the tree: fine.
    tarball.add_symlink("lib/current", "versions/3.11").unwrap();
    tarball.add_symlink("lib/up", "../shared").unwrap();

    // Escaping: rejected.
    assert!(matches!(
        tarball.add_symlink("top", "../../outside"),
        Err(Error::UnsafePath { .. })
    ));
    assert!(matches!(
        tarball.add_symlink("abs", "/etc/passwd"),
        Err(Error::UnsafePath { .. })
    ));
}

#[test]
fn test_unreadable_source_is_io_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("never-created.py");

    let mut tarball = LayerTarball::new("app", Some(0));
    let err = tarball.add_path("never.py", &missing).unwrap_err();
    assert!(matches!(err, Error::IoAt { .. }));
}

// =============================================================================
// Hashing Tests
// =============================================================================

#[test]
fn test_uncompressed_digest_equals_diff_id() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("main.py", b"print('hi')".to_vec(), false).unwrap();

    let mut out = Vec::new();
    let summary = tarball.write_to(&mut out, false).unwrap();

    assert_eq!(summary.diff_id, summary.digest);
    assert_eq!(summary.diff_id, Digest::from_bytes(&out));
    assert_eq!(summary.size, out.len() as u64);
}

#[test]
fn test_gzip_wraps_both_hashes_in_one_pass() {
    let mut tarball = LayerTarball::new("app", Some(0));
    tarball.add_bytes("main.py", b"print('hi')".to_vec(), false).unwrap();

    let mut compressed = Vec::new();
    let summary = tarball.write_to(&mut compressed, true).unwrap();

    // Descriptor digest covers the compressed bytes.
    assert_eq!(summary.digest, Digest::from_bytes(&compressed));
    assert_eq!(summary.size, compressed.len() as u64);

    // diff_id covers the decompressed stream.
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
    let mut uncompressed = Vec::new();
    decoder.read_to_end(&mut uncompressed).unwrap();
    assert_eq!(summary.diff_id, Digest::from_bytes(&uncompressed));
}
