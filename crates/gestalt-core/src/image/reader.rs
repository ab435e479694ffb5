//! Opening container files.

use super::{LoadedObject, SectionData, Symbol};
use crate::error::{Error, Result};
use crate::layout::ByteOrder;
use bytes::Bytes;
use object::read::macho::{FatArch, MachOFatFile32, MachOFatFile64};
use object::{Architecture, FileKind, Object, ObjectSection, ObjectSymbol};
use std::borrow::Cow;
use std::fs;
use std::path::Path;
use tracing::{debug, trace};

/// Trait for turning a file into named sections and symbols
///
/// The scanner only talks to this trait, so tests and embedders can supply
/// images that never touch the file system.
pub trait ObjectFileReader: Send + Sync {
    /// Opens and parses the file at `path`
    fn open(&self, path: &Path) -> Result<LoadedObject>;
}

/// Reader for Mach-O, ELF and PE/COFF files built on the `object` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectReader;

impl ObjectReader {
    /// Parses an in-memory file; `path` is only used in errors
    ///
    /// Universal Mach-O files are narrowed to the slice for the host
    /// architecture, or to their first slice when the host is not among them.
    pub fn parse(&self, path: &Path, data: Bytes) -> Result<LoadedObject> {
        let data = match universal_slice(path, &data)? {
            Some(slice) => data.slice_ref(slice),
            None => data,
        };
        let file =
            object::File::parse(&*data).map_err(|e| Error::file_format(path, e.to_string()))?;
        debug!(
            "Parsed {} as {:?} ({} bytes)",
            path.display(),
            file.format(),
            data.len()
        );

        let mut sections = Vec::new();
        for section in file.sections() {
            let Ok(name) = section.name() else {
                trace!("Skipping section with unreadable name");
                continue;
            };
            let contents = match section.uncompressed_data() {
                Ok(Cow::Borrowed(bytes)) => data.slice_ref(bytes),
                Ok(Cow::Owned(bytes)) => Bytes::from(bytes),
                Err(e) => {
                    trace!("Skipping section {}: {}", name, e);
                    continue;
                }
            };
            sections.push(SectionData::new(name, section.address(), contents));
        }

        let symbols = file
            .symbols()
            .filter(|symbol| symbol.is_definition())
            .filter_map(|symbol| {
                let name = symbol.name().ok()?;
                Some(Symbol {
                    name: name.to_string(),
                    address: symbol.address(),
                })
            })
            .collect();

        let object = LoadedObject {
            sections,
            symbols,
            pointer_width: if file.is_64() { 8 } else { 4 },
            byte_order: if file.is_little_endian() {
                ByteOrder::Little
            } else {
                ByteOrder::Big
            },
        };
        object.check_address_space(path)?;
        Ok(object)
    }
}

/// The slice of a universal binary to load, `None` for thin files
fn universal_slice<'d>(path: &Path, data: &'d [u8]) -> Result<Option<&'d [u8]>> {
    let invalid = |e: object::Error| Error::file_format(path, e.to_string());
    match FileKind::parse(data) {
        Ok(FileKind::MachOFat32) => {
            let fat = MachOFatFile32::parse(data).map_err(invalid)?;
            select_slice(path, fat.arches(), data).map(Some)
        }
        Ok(FileKind::MachOFat64) => {
            let fat = MachOFatFile64::parse(data).map_err(invalid)?;
            select_slice(path, fat.arches(), data).map(Some)
        }
        _ => Ok(None),
    }
}

fn select_slice<'d, A: FatArch>(path: &Path, arches: &[A], data: &'d [u8]) -> Result<&'d [u8]> {
    let host = host_architecture();
    let arch = arches
        .iter()
        .find(|arch| Some(arch.architecture()) == host)
        .or_else(|| arches.first())
        .ok_or_else(|| Error::file_format(path, "universal binary has no slices"))?;
    debug!(
        "Using {:?} slice of universal binary {} ({} slices)",
        arch.architecture(),
        path.display(),
        arches.len()
    );
    arch.data(data)
        .map_err(|e| Error::file_format(path, e.to_string()))
}

fn host_architecture() -> Option<Architecture> {
    match std::env::consts::ARCH {
        "aarch64" => Some(Architecture::Aarch64),
        "x86_64" => Some(Architecture::X86_64),
        "x86" => Some(Architecture::I386),
        "arm" => Some(Architecture::Arm),
        "powerpc" => Some(Architecture::PowerPc),
        "powerpc64" => Some(Architecture::PowerPc64),
        _ => None,
    }
}

impl ObjectFileReader for ObjectReader {
    fn open(&self, path: &Path) -> Result<LoadedObject> {
        let data = fs::read(path).map_err(|e| Error::file_read(path, e))?;
        self.parse(path, Bytes::from(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CPU_TYPE_X86_64: u32 = 0x0100_0007;
    const CPU_TYPE_ARM64: u32 = 0x0100_000C;

    /// 64-bit Mach-O with one `__swift5_builtin` section holding `contents`
    fn thin_macho(cputype: u32, address: u64, contents: &[u8]) -> Vec<u8> {
        const HEADER: u32 = 32;
        const SEGMENT: u32 = 72 + 80;
        let offset = HEADER + SEGMENT;

        let mut out = Vec::new();
        for word in [0xFEED_FACF, cputype, 0, 1, 1, SEGMENT, 0, 0] {
            out.extend_from_slice(&u32::to_le_bytes(word));
        }

        out.extend_from_slice(&0x19u32.to_le_bytes());
        out.extend_from_slice(&SEGMENT.to_le_bytes());
        out.extend_from_slice(&[0; 16]);
        for value in [address, contents.len() as u64, u64::from(offset), contents.len() as u64] {
            out.extend_from_slice(&value.to_le_bytes());
        }
        for word in [7u32, 7, 1, 0] {
            out.extend_from_slice(&word.to_le_bytes());
        }

        out.extend_from_slice(b"__swift5_builtin");
        out.extend_from_slice(b"__TEXT\0\0\0\0\0\0\0\0\0\0");
        out.extend_from_slice(&address.to_le_bytes());
        out.extend_from_slice(&(contents.len() as u64).to_le_bytes());
        for word in [offset, 2, 0, 0, 0, 0, 0, 0] {
            out.extend_from_slice(&word.to_le_bytes());
        }

        out.extend_from_slice(contents);
        out
    }

    /// Universal binary wrapping `slices`, each 8-byte aligned
    fn universal(slices: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut offset = 8 + 20 * slices.len();
        offset = (offset + 7) & !7;

        let mut out = Vec::new();
        out.extend_from_slice(&0xCAFE_BABEu32.to_be_bytes());
        out.extend_from_slice(&(slices.len() as u32).to_be_bytes());
        let mut placed = Vec::new();
        for (cputype, slice) in slices {
            for word in [*cputype, 0, offset as u32, slice.len() as u32, 3] {
                out.extend_from_slice(&word.to_be_bytes());
            }
            placed.push(offset);
            offset = (offset + slice.len() + 7) & !7;
        }
        for ((_, slice), at) in slices.iter().zip(placed) {
            out.resize(at, 0);
            out.extend_from_slice(slice);
        }
        out
    }

    fn builtin_contents(object: &LoadedObject) -> &[u8] {
        &object
            .sections
            .iter()
            .find(|section| section.name == "__swift5_builtin")
            .unwrap()
            .contents
    }

    #[test]
    fn test_thin_macho() {
        let data = thin_macho(CPU_TYPE_ARM64, 0x4000, &[1, 2, 3, 4]);
        let object = ObjectReader
            .parse(Path::new("Thin"), Bytes::from(data))
            .unwrap();
        assert_eq!(object.pointer_width, 8);
        assert_eq!(object.byte_order, ByteOrder::Little);
        assert_eq!(builtin_contents(&object), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_universal_macho_loads_one_slice() {
        let host = match host_architecture() {
            Some(Architecture::X86_64) => CPU_TYPE_X86_64,
            _ => CPU_TYPE_ARM64,
        };
        let other = if host == CPU_TYPE_ARM64 {
            CPU_TYPE_X86_64
        } else {
            CPU_TYPE_ARM64
        };
        let data = universal(&[
            (other, thin_macho(other, 0x4000, &[0xAA; 4])),
            (host, thin_macho(host, 0x8000, &[0xBB; 4])),
        ]);

        let object = ObjectReader
            .parse(Path::new("Universal"), Bytes::from(data))
            .unwrap();
        let expected = match host_architecture() {
            Some(Architecture::X86_64) | Some(Architecture::Aarch64) => [0xBB; 4],
            _ => [0xAA; 4],
        };
        assert_eq!(builtin_contents(&object), &expected);
    }

    #[test]
    fn test_universal_macho_without_slices() {
        let data = universal(&[]);
        assert!(matches!(
            ObjectReader.parse(Path::new("Empty"), Bytes::from(data)),
            Err(Error::FileFormat { .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let result = ObjectReader.open(Path::new("/nonexistent/libMissing.dylib"));
        assert!(matches!(result, Err(Error::FileRead { .. })));
    }

    #[test]
    fn test_garbage_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an object file").unwrap();
        file.flush().unwrap();

        match ObjectReader.open(file.path()) {
            Err(Error::FileFormat { path, .. }) => assert_eq!(path, file.path()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_file() {
        let file = NamedTempFile::new().unwrap();
        assert!(matches!(
            ObjectReader.open(file.path()),
            Err(Error::FileFormat { .. })
        ));
    }
}
