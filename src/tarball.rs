//! Deterministic tar archive writer for image layers.
//!
//! The byte sequence produced here is a function purely of the logical
//! contents of the archive: entry path, file bytes, normalized mode, and
//! entry type. Nothing else leaks in:
//!
//! - Entries are emitted in lexicographic order of their archive path,
//!   regardless of insertion order.
//! - Paths are normalized to forward slashes and rooted at the archive
//!   prefix with no leading slash.
//! - Modification times are pinned (epoch zero by default, or a supplied
//!   reproducible timestamp); owner and group are fixed to `0`/`root`.
//! - Modes are normalized: directories `0755`, regular files `0644`,
//!   executables `0755`, symlinks keep their stored target verbatim.
//! - No global header and no intermediate directory entries; only the
//!   archive root directory is emitted, so an empty layer is still a
//!   well-formed, stable tar.
//!
//! Paths (or symlink targets) beyond the USTAR name limit are emitted
//! as PAX extended headers: a type-`x` entry carrying `path=` /
//! `linkpath=` records directly precedes the affected entry. The
//! records are themselves emitted in a deterministic order, so an
//! over-limit path is still a pure function of its logical content.
//!
//! Hashing the uncompressed stream yields the layer *diff_id*; when the
//! stream is gzipped, a second hasher on the compressed side yields the
//! descriptor *digest*. Both are computed in one streaming pass.

use crate::digest::{Digest, HashingWriter};
use crate::error::{Error, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

/// Longest path that fits the USTAR `name` field; anything longer goes
/// through a PAX extended header.
const USTAR_NAME_LIMIT: usize = 100;

/// What a tar entry contains.
enum EntryData {
    /// Regular file backed by a source path, read at write time.
    File(PathBuf),
    /// Regular file backed by in-memory bytes.
    Bytes(Vec<u8>),
    /// Symlink with its stored target.
    Symlink(String),
}

struct Entry {
    data: EntryData,
    mode: u32,
    mtime: u64,
}

/// Result of serializing a layer archive.
#[derive(Debug, Clone)]
pub struct TarSummary {
    /// Digest of the uncompressed tar stream (`rootfs.diff_ids` entry).
    pub diff_id: Digest,
    /// Digest of the bytes actually written to the sink. Equals
    /// `diff_id` when the stream is not compressed.
    pub digest: Digest,
    /// Number of bytes written to the sink.
    pub size: u64,
}

/// Deterministic layer archive builder.
///
/// Collects entries keyed by archive path, then serializes them in
/// lexicographic order through [`LayerTarball::write_to`].
pub struct LayerTarball {
    prefix: String,
    mtime_override: Option<u64>,
    entries: BTreeMap<String, Entry>,
}

impl LayerTarball {
    /// Creates a builder rooted at `prefix` (e.g. `app`).
    ///
    /// `mtime_override` pins every entry's modification time; `None`
    /// preserves source filesystem mtimes (non-reproducible mode).
    pub fn new(prefix: &str, mtime_override: Option<u64>) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
            mtime_override,
            entries: BTreeMap::new(),
        }
    }

    /// Number of file entries added so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no file entries have been added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a regular file or symlink from the source filesystem.
    ///
    /// `archive_path` is relative to the archive prefix. Mode and entry
    /// type are derived from the source: symlinks are preserved, files
    /// are `0644` unless the executable predicate (`.sh` extension or
    /// any execute bit on the source) promotes them to `0755`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsafePath`] if the path escapes the archive root or a
    ///   symlink target escapes it.
    /// - [`Error::DuplicateEntry`] if the archive path was already added.
    /// - [`Error::IoAt`] if the source is unreadable.
    pub fn add_path(&mut self, archive_path: &str, source: &Path) -> Result<()> {
        let normalized = self.normalize(archive_path)?;

        let meta = fs::symlink_metadata(source).map_err(|e| Error::io_at(source, e))?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(source).map_err(|e| Error::io_at(source, e))?;
            let target = target.to_string_lossy().replace('\\', "/");
            self.check_symlink_target(&normalized, &target)?;
            return self.insert(
                normalized,
                Entry {
                    data: EntryData::Symlink(target),
                    mode: 0o777,
                    mtime: self.entry_mtime(&meta),
                },
            );
        }

        if !meta.is_file() {
            return Err(Error::UnsafePath {
                path: archive_path.to_string(),
            });
        }

        let mode = if is_executable(source, &meta) { 0o755 } else { 0o644 };
        let mtime = self.entry_mtime(&meta);
        self.insert(
            normalized,
            Entry {
                data: EntryData::File(source.to_path_buf()),
                mode,
                mtime,
            },
        )
    }

    /// Adds a regular file from in-memory bytes.
    pub fn add_bytes(&mut self, archive_path: &str, data: Vec<u8>, executable: bool) -> Result<()> {
        let normalized = self.normalize(archive_path)?;
        let mode = if executable { 0o755 } else { 0o644 };
        self.insert(
            normalized,
            Entry {
                data: EntryData::Bytes(data),
                mode,
                mtime: self.mtime_override.unwrap_or(0),
            },
        )
    }

    /// Adds a symlink with an explicit stored target.
    pub fn add_symlink(&mut self, archive_path: &str, target: &str) -> Result<()> {
        let normalized = self.normalize(archive_path)?;
        self.check_symlink_target(&normalized, target)?;
        self.insert(
            normalized,
            Entry {
                data: EntryData::Symlink(target.to_string()),
                mode: 0o777,
                mtime: self.mtime_override.unwrap_or(0),
            },
        )
    }

    /// Serializes the archive into `sink`.
    ///
    /// With `gzip`, the uncompressed stream is hashed for the diff_id
    /// while the compressed stream is hashed for the descriptor digest;
    /// both happen in the same pass.
    pub fn write_to<W: Write>(self, sink: W, gzip: bool) -> Result<TarSummary> {
        if gzip {
            let outer = HashingWriter::new(sink);
            let encoder = GzEncoder::new(outer, Compression::default());
            let inner = HashingWriter::new(encoder);

            let inner = self.write_entries(inner)?;
            let (encoder, diff_id, _) = inner.finalize();
            let outer = encoder.finish()?;
            let (_, digest, size) = outer.finalize();

            Ok(TarSummary {
                diff_id,
                digest,
                size,
            })
        } else {
            let inner = HashingWriter::new(sink);
            let inner = self.write_entries(inner)?;
            let (_, diff_id, size) = inner.finalize();

            Ok(TarSummary {
                digest: diff_id.clone(),
                diff_id,
                size,
            })
        }
    }

    fn write_entries<W: Write>(self, sink: W) -> Result<W> {
        let mut builder = tar::Builder::new(sink);
        let root_mtime = self.mtime_override.unwrap_or(0);

        // Root directory entry. Always present so an empty layer is
        // still a non-empty, well-formed archive.
        if !self.prefix.is_empty() {
            let mut header = tar::Header::new_ustar();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(root_mtime);
            header.set_size(0);
            set_owner_names(&mut header)?;
            builder.append_data(&mut header, format!("{}/", self.prefix), std::io::empty())?;
        }

        // BTreeMap iteration gives lexicographic order of archive paths.
        for (path, entry) in self.entries {
            // Over-limit names go through a PAX extended header placed
            // directly before the entry; the USTAR name fields then
            // carry a truncated stand-in that PAX-aware readers ignore.
            let long_path = path.len() > USTAR_NAME_LIMIT;
            let long_link = match &entry.data {
                EntryData::Symlink(target) => target.len() > USTAR_NAME_LIMIT,
                _ => false,
            };
            if long_path || long_link {
                let link = match &entry.data {
                    EntryData::Symlink(target) => Some(target.as_str()),
                    _ => None,
                };
                append_pax_header(&mut builder, &path, link, entry.mtime)?;
            }
            let header_path = truncate_utf8(&path, USTAR_NAME_LIMIT);

            let mut header = tar::Header::new_ustar();
            header.set_uid(0);
            header.set_gid(0);
            header.set_mtime(entry.mtime);
            header.set_mode(entry.mode);
            set_owner_names(&mut header)?;

            match entry.data {
                EntryData::File(source) => {
                    let file = fs::File::open(&source).map_err(|e| Error::io_at(&source, e))?;
                    let len = file.metadata().map_err(|e| Error::io_at(&source, e))?.len();
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(len);
                    builder.append_data(&mut header, header_path, file)?;
                }
                EntryData::Bytes(data) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(data.len() as u64);
                    builder.append_data(&mut header, header_path, data.as_slice())?;
                }
                EntryData::Symlink(target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    let header_target = truncate_utf8(&target, USTAR_NAME_LIMIT);
                    builder.append_link(&mut header, header_path, header_target)?;
                }
            }
        }

        let mut sink = builder.into_inner()?;
        sink.flush()?;
        Ok(sink)
    }

    fn insert(&mut self, path: String, entry: Entry) -> Result<()> {
        if self.entries.contains_key(&path) {
            return Err(Error::DuplicateEntry { path });
        }
        self.entries.insert(path, entry);
        Ok(())
    }

    fn entry_mtime(&self, meta: &fs::Metadata) -> u64 {
        match self.mtime_override {
            Some(t) => t,
            None => meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Normalizes an archive path and roots it at the prefix.
    ///
    /// Rejects absolute paths, `..` components, and empty paths.
    fn normalize(&self, archive_path: &str) -> Result<String> {
        let cleaned = archive_path.replace('\\', "/");
        let mut parts = Vec::new();

        for component in Path::new(&cleaned).components() {
            match component {
                Component::Normal(p) => parts.push(p.to_string_lossy().into_owned()),
                Component::CurDir => {}
                _ => {
                    return Err(Error::UnsafePath {
                        path: archive_path.to_string(),
                    });
                }
            }
        }

        if parts.is_empty() {
            return Err(Error::UnsafePath {
                path: archive_path.to_string(),
            });
        }

        if self.prefix.is_empty() {
            Ok(parts.join("/"))
        } else {
            Ok(format!("{}/{}", self.prefix, parts.join("/")))
        }
    }

    /// Rejects symlink targets that resolve outside the archive root.
    fn check_symlink_target(&self, entry_path: &str, target: &str) -> Result<()> {
        if target.starts_with('/') {
            return Err(Error::UnsafePath {
                path: format!("{} -> {}", entry_path, target),
            });
        }

        // Walk the target relative to the entry's parent directory; a
        // negative depth at any point escapes the root.
        let mut depth = entry_path.matches('/').count() as i64;
        for part in target.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(Error::UnsafePath {
                            path: format!("{} -> {}", entry_path, target),
                        });
                    }
                }
                _ => depth += 1,
            }
        }
        Ok(())
    }
}

/// Emits a PAX extended header (type `x`) carrying `path` and/or
/// `linkpath` records for the entry that follows.
///
/// Records are sorted by key and the header entry's own name is a
/// truncated `PaxHeaders/` stand-in, so the emitted bytes depend only
/// on the logical path, target, and pinned mtime.
fn append_pax_header<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    link_target: Option<&str>,
    mtime: u64,
) -> Result<()> {
    let mut records: Vec<(&str, &str)> = Vec::new();
    if let Some(target) = link_target {
        if target.len() > USTAR_NAME_LIMIT {
            records.push(("linkpath", target));
        }
    }
    if path.len() > USTAR_NAME_LIMIT {
        records.push(("path", path));
    }
    records.sort_by_key(|(key, _)| *key);

    let mut data = Vec::new();
    for (key, value) in records {
        data.extend_from_slice(pax_record(key, value).as_bytes());
    }

    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::XHeader);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(mtime);
    header.set_size(data.len() as u64);
    set_owner_names(&mut header)?;

    let name = format!("PaxHeaders/{}", path.rsplit('/').next().unwrap_or(path));
    builder.append_data(
        &mut header,
        truncate_utf8(&name, USTAR_NAME_LIMIT),
        data.as_slice(),
    )?;
    Ok(())
}

/// One PAX record: `<len> <key>=<value>\n`, where `<len>` counts the
/// whole record including its own digits.
fn pax_record(key: &str, value: &str) -> String {
    let base = key.len() + value.len() + 3;
    let mut len = base + 1;
    loop {
        let digits = len.to_string().len();
        if base + digits == len {
            break;
        }
        len = base + digits;
    }
    format!("{} {}={}\n", len, key, value)
}

/// Truncates to at most `max` bytes on a char boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn set_owner_names(header: &mut tar::Header) -> Result<()> {
    header
        .set_username("root")
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    header
        .set_groupname("root")
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    Ok(())
}

/// Stable executable predicate: `.sh` extension, or any execute bit on
/// the source file.
fn is_executable(path: &Path, meta: &fs::Metadata) -> bool {
    if path.extension().map(|e| e == "sh").unwrap_or(false) {
        return true;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        let _ = meta;
        false
    }
}
