//! Scanning synthetic images through the public API.

use gestalt_core::catalog::{FieldDescriptor, FieldDescriptorKind};
use gestalt_core::{
    Error, FailurePolicy, LoadedObject, ObjectFileReader, Result, ScannerConfig, Scanner,
    ScannerState, SectionRole, VerbatimNames,
};
use pretty_assertions::assert_eq;
use std::path::Path;

const FIELDMD: u64 = 0x1000;
const TYPEREF: u64 = 0x2000;
const REFLSTR: u64 = 0x3000;

/// Little-endian section contents addressed from `base`
struct Section {
    base: u64,
    bytes: Vec<u8>,
}

impl Section {
    fn new(base: u64) -> Self {
        Self {
            base,
            bytes: Vec::new(),
        }
    }

    fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn rel(&mut self, target: u64) -> &mut Self {
        let here = self.base + self.bytes.len() as u64;
        self.u32((target as i64 - here as i64) as i32 as u32)
    }
}

/// `struct Point { var x: Int; let y: Int }`
fn point(section: &mut Section) {
    section.rel(TYPEREF).u32(0).u16(0).u16(12).u32(2);
    section.u32(2).rel(TYPEREF + 14).rel(REFLSTR);
    section.u32(0).rel(TYPEREF + 14).rel(REFLSTR + 2);
}

fn image(fieldmd: Vec<u8>) -> LoadedObject {
    LoadedObject::new()
        .with_section("__text", 0x100, vec![0xC3; 4])
        .with_section("__swift5_fieldmd", FIELDMD, fieldmd)
        .with_section("__swift5_typeref", TYPEREF, b"V4Demo5PointV\0Si\0".to_vec())
        .with_section("__swift5_reflstr", REFLSTR, b"x\0y\0".to_vec())
        .with_symbol("_$s4Demo5PointVMn", 0x100)
}

/// Reader handing out a prepared object for any path
struct FakeReader {
    fieldmd: Vec<u8>,
}

impl ObjectFileReader for FakeReader {
    fn open(&self, path: &Path) -> Result<LoadedObject> {
        if path.ends_with("missing") {
            return Err(Error::file_format(path, "not an object file"));
        }
        Ok(image(self.fieldmd.clone()))
    }
}

fn scanner(fieldmd: Vec<u8>, policy: FailurePolicy) -> Scanner<FakeReader> {
    Scanner::with_reader(
        FakeReader { fieldmd },
        ScannerConfig::new().failure_policy(policy),
    )
}

#[test]
fn test_one_descriptor_with_two_fields() {
    let mut fieldmd = Section::new(FIELDMD);
    point(&mut fieldmd);
    let mut scanner = scanner(fieldmd.bytes, FailurePolicy::Isolate);

    let id = scanner.add_image("Demo").unwrap();
    assert_eq!(scanner.state(), ScannerState::Loaded(1));
    assert!(scanner.issues().is_empty());

    let records = scanner.records(SectionRole::FieldMetadata);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].image, id);
    assert_eq!(records[0].address, FIELDMD);

    let fields = records[0].value.repeat("fields").unwrap();
    assert_eq!(fields.len(), 2);
    let addresses: Vec<_> = fields
        .iter()
        .map(|field| field.as_record().unwrap().address())
        .collect();
    assert_eq!(addresses, vec![FIELDMD + 16, FIELDMD + 28]);

    let descriptors = scanner.typed_records::<FieldDescriptor>(&VerbatimNames);
    let descriptor = descriptors.into_iter().next().unwrap().unwrap();
    assert_eq!(descriptor.kind, FieldDescriptorKind::Struct);
    let names: Vec<_> = descriptor
        .fields
        .iter()
        .map(|field| (field.name.as_deref(), field.is_var()))
        .collect();
    assert_eq!(names, vec![(Some("x"), true), (Some("y"), false)]);

    let image = scanner.image(id).unwrap();
    assert_eq!(image.symbol_at(0x100).unwrap().name, "_$s4Demo5PointVMn");
}

#[test]
fn test_corrupt_second_record_is_isolated() {
    let mut fieldmd = Section::new(FIELDMD);
    point(&mut fieldmd);
    // declares three fields, provides one
    fieldmd.rel(TYPEREF).u32(0).u16(0).u16(12).u32(3);
    fieldmd.u32(0).rel(TYPEREF + 14).rel(REFLSTR);
    let mut scanner = scanner(fieldmd.bytes, FailurePolicy::Isolate);

    scanner.add_image("Demo").unwrap();
    assert_eq!(scanner.records(SectionRole::FieldMetadata).len(), 1);

    let issues: Vec<_> = scanner
        .issues()
        .iter()
        .filter(|issue| issue.role == Some(SectionRole::FieldMetadata))
        .collect();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].section, "__swift5_fieldmd");
    assert_eq!(issues[0].address, FIELDMD + 40);
    assert!(issues[0].error.is_recoverable());
}

#[test]
fn test_fail_fast_rejects_image() {
    let mut fieldmd = Section::new(FIELDMD);
    point(&mut fieldmd);
    fieldmd.u32(0xFFFF_FFFF);
    let mut scanner = scanner(fieldmd.bytes, FailurePolicy::FailFast);

    let err = scanner.add_image("Demo").unwrap_err();
    assert!(matches!(err, Error::BufferTooShort { .. }));
    assert_eq!(scanner.state(), ScannerState::Empty);
    assert!(scanner.records(SectionRole::FieldMetadata).is_empty());
}

#[test]
fn test_reader_failure_leaves_scanner_unchanged() {
    let mut scanner = scanner(Vec::new(), FailurePolicy::Isolate);
    scanner.add_image("Demo").unwrap();

    let err = scanner.add_image("/tmp/missing").unwrap_err();
    assert!(matches!(err, Error::FileFormat { .. }));
    assert_eq!(scanner.state(), ScannerState::Loaded(1));
}
