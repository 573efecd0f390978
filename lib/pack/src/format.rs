//! The pack container format.
//!
//! A pack is a single binary blob carrying the compiler module, the linker
//! module, the package-name list and the pre-built stdlib archives:
//!
//! ```text
//! magic      8   ASCII "GOSCRIPT"
//! version    u32 LE, must be 2
//! L1         u32 LE, compiler length    } followed by L1 bytes
//! L2         u32 LE, linker length      } followed by L2 bytes
//! L3         u32 LE, JSON length        } followed by a UTF-8 JSON
//!                                         array of package names
//! N          u32 LE, package count
//! Ix         u64 LE, absolute offset of the index
//! data       concatenated archive blobs
//! index @Ix  N x { name_len u16, name, data_offset u64 (relative to
//!                  the data region), data_size u32 }
//! ```
//!
//! All integers are little-endian. Every declared length is validated
//! against the remaining buffer before slicing, and archives are exposed
//! as views into the pack buffer, never copied.

use std::collections::BTreeMap;

use bytes::Bytes;
use goscript_vfs::Vfs;

use crate::{PackError, PackResult};

pub const PACK_MAGIC: &[u8; 8] = b"GOSCRIPT";
pub const PACK_VERSION: u32 = 2;

/// The `GOOS_GOARCH` directory the archives are staged under.
pub const ARCH_TARGET: &str = "js_wasm";

/// Directory in the VFS that receives the stdlib archives.
pub fn archive_dir() -> String {
    format!("/pkg/{ARCH_TARGET}")
}

/// A sequential little-endian reader over the pack buffer. Slices handed
/// out are refcounted views into the same allocation.
struct SliceReader {
    buf: Bytes,
    pos: usize,
}

impl SliceReader {
    fn new(buf: Bytes) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &str) -> PackResult<Bytes> {
        if len > self.remaining() {
            return Err(PackError::Format(format!(
                "{what} of {len} bytes overruns the pack ({} bytes remain)",
                self.remaining()
            )));
        }
        let view = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(view)
    }

    fn u16_le(&mut self, what: &str) -> PackResult<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self, what: &str) -> PackResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_le(&mut self, what: &str) -> PackResult<u64> {
        let b = self.take(8, what)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn seek(&mut self, pos: usize, what: &str) -> PackResult<()> {
        if pos > self.buf.len() {
            return Err(PackError::Format(format!(
                "{what} at {pos} lies outside the {}-byte pack",
                self.buf.len()
            )));
        }
        self.pos = pos;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ArchiveEntry {
    /// Offset within the full pack where the blob begins.
    offset: usize,
    size: usize,
}

/// A parsed pack. Parsing happens exactly once; the accessors return
/// views into the original buffer that stay valid for the pack's lifetime.
#[derive(Debug, Clone)]
pub struct Pack {
    raw: Bytes,
    compiler: Bytes,
    linker: Bytes,
    package_names: Vec<String>,
    index: BTreeMap<String, ArchiveEntry>,
}

impl Pack {
    /// Validate the header and parse the section table.
    pub fn parse(raw: Bytes) -> PackResult<Self> {
        let mut reader = SliceReader::new(raw.clone());

        let magic = reader.take(PACK_MAGIC.len(), "magic")?;
        if magic.as_ref() != &PACK_MAGIC[..] {
            return Err(PackError::Format(format!(
                "bad magic {:02x?}, want {:02x?}",
                magic.as_ref(),
                PACK_MAGIC
            )));
        }
        let version = reader.u32_le("version")?;
        if version != PACK_VERSION {
            return Err(PackError::Format(format!(
                "unsupported pack version {version}, want {PACK_VERSION}"
            )));
        }

        let compiler_len = reader.u32_le("compiler length")? as usize;
        let compiler = reader.take(compiler_len, "compiler section")?;
        let linker_len = reader.u32_le("linker length")? as usize;
        let linker = reader.take(linker_len, "linker section")?;

        let names_len = reader.u32_le("package name length")? as usize;
        let names_json = reader.take(names_len, "package name section")?;
        let package_names: Vec<String> = if names_json.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&names_json)
                .map_err(|e| PackError::Format(format!("package name JSON: {e}")))?
        };

        let package_count = reader.u32_le("package count")? as usize;

        let mut index = BTreeMap::new();
        if package_count > 0 || reader.remaining() >= 8 {
            let index_offset = reader.u64_le("index offset")? as usize;
            let data_start = reader.pos;

            reader.seek(index_offset, "index")?;
            for n in 0..package_count {
                let name_len = reader.u16_le("index entry name length")? as usize;
                let name_bytes = reader.take(name_len, "index entry name")?;
                let name = std::str::from_utf8(&name_bytes)
                    .map_err(|_| {
                        PackError::Format(format!("index entry {n} name is not UTF-8"))
                    })?
                    .to_string();
                let data_offset = reader.u64_le("index entry offset")? as usize;
                let data_size = reader.u32_le("index entry size")? as usize;

                let offset = data_start
                    .checked_add(data_offset)
                    .ok_or_else(|| PackError::Format(format!("archive {name} offset overflow")))?;
                let end = offset.checked_add(data_size).ok_or_else(|| {
                    PackError::Format(format!("archive {name} size overflow"))
                })?;
                if end > raw.len() {
                    return Err(PackError::Format(format!(
                        "archive {name} ({offset}..{end}) lies outside the {}-byte pack",
                        raw.len()
                    )));
                }
                index.insert(
                    name,
                    ArchiveEntry {
                        offset,
                        size: data_size,
                    },
                );
            }
        }

        tracing::debug!(
            compiler = compiler.len(),
            linker = linker.len(),
            packages = index.len(),
            "pack parsed"
        );

        Ok(Self {
            raw,
            compiler,
            linker,
            package_names,
            index,
        })
    }

    pub fn compiler(&self) -> Bytes {
        self.compiler.clone()
    }

    pub fn linker(&self) -> Bytes {
        self.linker.clone()
    }

    pub fn package_names(&self) -> &[String] {
        &self.package_names
    }

    pub fn has_package(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// The archive blob for `name`, as a view into the pack buffer.
    pub fn package(&self, name: &str) -> Option<Bytes> {
        let entry = self.index.get(name)?;
        Some(self.raw.slice(entry.offset..entry.offset + entry.size))
    }

    pub fn package_count(&self) -> usize {
        self.index.len()
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    /// Iterate `(name, size)` over the archive index.
    pub fn entries(&self) -> impl Iterator<Item = (&str, usize)> {
        self.index.iter().map(|(name, e)| (name.as_str(), e.size))
    }

    /// Write every archive into the VFS at `/pkg/<arch-target>/<name>.a`.
    /// The writes hand over buffer views, not copies.
    pub fn load_archives_into(&self, vfs: &Vfs) {
        let dir = archive_dir();
        vfs.create_dir(&dir);
        for (name, entry) in self.index.iter() {
            let blob = self.raw.slice(entry.offset..entry.offset + entry.size);
            vfs.write_file(&format!("{dir}/{name}.a"), blob);
        }
        tracing::debug!(packages = self.index.len(), dir = %dir, "stdlib archives staged");
    }
}

/// Serializes packs in the layout [`Pack::parse`] reads. Used by tests and
/// the CLI's pack tooling.
#[derive(Debug, Default)]
pub struct PackBuilder {
    compiler: Vec<u8>,
    linker: Vec<u8>,
    packages: Vec<(String, Vec<u8>)>,
}

impl PackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiler(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.compiler = bytes.into();
        self
    }

    pub fn linker(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.linker = bytes.into();
        self
    }

    pub fn package(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.packages.push((name.into(), bytes.into()));
        self
    }

    pub fn build(self) -> Bytes {
        let names: Vec<&str> = self.packages.iter().map(|(n, _)| n.as_str()).collect();
        let names_json = serde_json::to_vec(&names).expect("string array always serializes");

        let mut out = Vec::new();
        out.extend_from_slice(PACK_MAGIC);
        out.extend_from_slice(&PACK_VERSION.to_le_bytes());
        out.extend_from_slice(&(self.compiler.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.compiler);
        out.extend_from_slice(&(self.linker.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.linker);
        out.extend_from_slice(&(names_json.len() as u32).to_le_bytes());
        out.extend_from_slice(&names_json);
        out.extend_from_slice(&(self.packages.len() as u32).to_le_bytes());

        let index_offset_at = out.len();
        out.extend_from_slice(&0u64.to_le_bytes());

        let data_start = out.len();
        let mut offsets = Vec::with_capacity(self.packages.len());
        for (_, blob) in &self.packages {
            offsets.push((out.len() - data_start) as u64);
            out.extend_from_slice(blob);
        }

        let index_offset = out.len() as u64;
        out[index_offset_at..index_offset_at + 8].copy_from_slice(&index_offset.to_le_bytes());
        for ((name, blob), offset) in self.packages.iter().zip(offsets) {
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        }

        Bytes::from(out)
    }
}
