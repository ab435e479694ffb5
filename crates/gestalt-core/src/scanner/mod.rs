//! Section scanning front end.
//!
//! The [`Scanner`] owns every loaded [`Image`]. Adding an image opens it
//! through an [`ObjectFileReader`], classifies its sections with the
//! configured [`SectionTable`], and decodes the records of every role that
//! has a catalog layout, back to back across each section.
//!
//! ## Failure handling
//!
//! Under [`FailurePolicy::Isolate`] (the default) a corrupt record ends the
//! decoding of its section only: the records before it are kept, a
//! [`ScanIssue`] is recorded, and scanning continues with the next section.
//! [`FailurePolicy::FailFast`] instead rejects the whole image with the first
//! error and leaves the scanner untouched.
//!
//! ```no_run
//! use gestalt_core::{Scanner, SectionRole};
//!
//! let mut scanner = Scanner::new();
//! let id = scanner.add_image("./MyApp")?;
//! for record in scanner.records(SectionRole::FieldMetadata) {
//!     println!("{} {:#x}", record.section, record.address);
//! }
//! scanner.remove_image(id)?;
//! # Ok::<(), gestalt_core::Error>(())
//! ```

mod table;

use crate::catalog::{self, CatalogRecord};
use crate::decode::{ByteReader, DecodedValue, Record};
use crate::error::{Error, Result};
use crate::image::{Image, ImageId, LoadedObject, ObjectFileReader, ObjectReader, SectionData};
use crate::layout::LayoutSpec;
use crate::resolve::{NameDecoder, RelativePointerResolver};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

pub use table::{SectionEntry, SectionRole, SectionTable};

/// Whether the scanner holds any images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    /// No image loaded
    Empty,
    /// This many images loaded
    Loaded(usize),
}

/// What to do when a record fails to decode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep what decoded, record an issue, move on
    #[default]
    Isolate,
    /// Reject the image with the first error
    FailFast,
}

/// Configuration for the scanner
#[derive(Debug, Clone, Default)]
pub struct ScannerConfig {
    /// Section classification table
    pub section_table: SectionTable,
    /// Handling of corrupt records
    pub failure_policy: FailurePolicy,
    /// Maximum number of records decoded per section (0 = unlimited)
    pub max_records_per_section: usize,
}

impl ScannerConfig {
    /// Creates a new scanner config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the section classification table
    pub fn section_table(mut self, table: SectionTable) -> Self {
        self.section_table = table;
        self
    }

    /// Sets the failure policy
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the per-section record limit
    pub fn max_records_per_section(mut self, max: usize) -> Self {
        self.max_records_per_section = max;
        self
    }
}

/// A record decoded from a metadata section
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    /// Image the record came from
    pub image: ImageId,
    /// Role of its section
    pub role: SectionRole,
    /// Name of its section
    pub section: String,
    /// Address of the record
    pub address: u64,
    /// Decoded contents
    pub value: Record,
}

/// A problem met while scanning an image
#[derive(Debug)]
pub struct ScanIssue {
    /// Image being scanned
    pub image: ImageId,
    /// Role of the section, if it was classified
    pub role: Option<SectionRole>,
    /// Name of the section
    pub section: String,
    /// Address of the record (or section) being decoded
    pub address: u64,
    /// What went wrong
    pub error: Error,
}

impl fmt::Display for ScanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.role {
            Some(role) => write!(
                f,
                "image {} section '{}' ({}) at {:#x}: {}",
                self.image, self.section, role, self.address, self.error
            ),
            None => write!(
                f,
                "image {} section '{}' at {:#x}: {}",
                self.image, self.section, self.address, self.error
            ),
        }
    }
}

/// Everything one image contributes, committed only on success
#[derive(Debug, Default)]
struct ImageScan {
    records: Vec<DecodedRecord>,
    issues: Vec<ScanIssue>,
}

/// Loads images and decodes their metadata sections
#[derive(Debug)]
pub struct Scanner<R: ObjectFileReader = ObjectReader> {
    config: ScannerConfig,
    reader: R,
    images: Vec<Image>,
    next_id: usize,
    records: BTreeMap<SectionRole, Vec<DecodedRecord>>,
    issues: Vec<ScanIssue>,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new()
    }
}

impl Scanner {
    /// Creates a scanner with the `object`-based reader and default configuration
    pub fn new() -> Self {
        Self::with_config(ScannerConfig::default())
    }

    /// Creates a scanner with the `object`-based reader and custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self::with_reader(ObjectReader, config)
    }
}

impl<R: ObjectFileReader> Scanner<R> {
    /// Creates a scanner that opens files through `reader`
    pub fn with_reader(reader: R, config: ScannerConfig) -> Self {
        Self {
            config,
            reader,
            images: Vec::new(),
            next_id: 0,
            records: BTreeMap::new(),
            issues: Vec::new(),
        }
    }

    /// Active configuration
    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Current state
    pub fn state(&self) -> ScannerState {
        match self.images.len() {
            0 => ScannerState::Empty,
            n => ScannerState::Loaded(n),
        }
    }

    /// Opens the file at `path` and scans it
    ///
    /// On error the scanner is left as it was.
    pub fn add_image(&mut self, path: impl AsRef<Path>) -> Result<ImageId> {
        let path = path.as_ref();
        debug!("Opening image {}", path.display());
        let object = self.reader.open(path)?;
        self.add_object(path, object)
    }

    /// Scans an already loaded object, registering it under `name`
    pub fn add_object(&mut self, name: impl Into<PathBuf>, object: LoadedObject) -> Result<ImageId> {
        let name = name.into();
        object.check_address_space(&name)?;
        let id = ImageId::new(self.next_id);
        let image = Image::from_object(id, name, object);
        let scan = self.scan_image(&image)?;

        debug!(
            "Image {} ({}): {} records, {} issues",
            id,
            image.path().display(),
            scan.records.len(),
            scan.issues.len()
        );

        self.next_id += 1;
        self.images.push(image);
        for record in scan.records {
            self.records.entry(record.role).or_default().push(record);
        }
        self.issues.extend(scan.issues);
        Ok(id)
    }

    /// Unloads an image along with its records and issues
    pub fn remove_image(&mut self, id: ImageId) -> Result<Image> {
        let index = self
            .images
            .iter()
            .position(|image| image.id() == id)
            .ok_or(Error::UnknownImage(id.index()))?;
        let image = self.images.remove(index);

        for records in self.records.values_mut() {
            records.retain(|record| record.image != id);
        }
        self.records.retain(|_, records| !records.is_empty());
        self.issues.retain(|issue| issue.image != id);

        debug!("Removed image {} ({})", id, image.path().display());
        Ok(image)
    }

    /// Loaded image with the given id
    pub fn image(&self, id: ImageId) -> Option<&Image> {
        self.images.iter().find(|image| image.id() == id)
    }

    /// Loaded images in load order
    pub fn images(&self) -> &[Image] {
        &self.images
    }

    /// Records of `role` across all images, in load and file order
    pub fn records(&self, role: SectionRole) -> &[DecodedRecord] {
        self.records.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Issues recorded while scanning
    pub fn issues(&self) -> &[ScanIssue] {
        &self.issues
    }

    /// Resolver for pointers in records of image `id`
    pub fn resolver(&self, id: ImageId) -> Result<RelativePointerResolver<'_>> {
        self.image(id)
            .map(Image::resolver)
            .ok_or(Error::UnknownImage(id.index()))
    }

    /// Typed views of every record of `T`'s role
    ///
    /// One result per record, in the order of [`Scanner::records`]; a record
    /// whose pointers do not resolve yields an error without affecting the
    /// others.
    pub fn typed_records<T: CatalogRecord>(&self, names: &dyn NameDecoder) -> Vec<Result<T>> {
        self.records(T::ROLE)
            .iter()
            .map(|record| {
                let resolver = self.resolver(record.image)?;
                T::from_record(&record.value, &resolver, names)
            })
            .collect()
    }

    fn scan_image(&self, image: &Image) -> Result<ImageScan> {
        let table = &self.config.section_table;
        let mut scan = ImageScan::default();

        debug!(
            "Scanning image {} with {} sections",
            image.id(),
            image.sections().len()
        );

        let mut classified = Vec::new();
        for section in image.sections() {
            match table.classify(&section.name) {
                Some(role) => {
                    trace!("Section {} is {}", section.name, role);
                    classified.push((role, section));
                }
                None if table.claims(&section.name) => {
                    trace!("Unrecognized metadata section {}", section.name);
                    scan.issues.push(ScanIssue {
                        image: image.id(),
                        role: None,
                        section: section.name.clone(),
                        address: section.address,
                        error: Error::UnrecognizedSection {
                            name: section.name.clone(),
                        },
                    });
                }
                None => trace!("Ignoring section {}", section.name),
            }
        }

        for &(role, section) in &classified {
            let missing = table
                .requirements(role)
                .iter()
                .find(|needed| !classified.iter().any(|(present, _)| present == *needed));
            if let Some(needed) = missing {
                debug!(
                    "Skipping {} in section {}: no {} section",
                    role, section.name, needed
                );
                continue;
            }

            let Some(spec) = catalog::layout_for(role, image.byte_order()) else {
                trace!("No record layout for {} section {}", role, section.name);
                continue;
            };

            if let Err((address, error)) = self.decode_section(image, role, section, spec, &mut scan)
            {
                match self.config.failure_policy {
                    FailurePolicy::FailFast => return Err(error),
                    FailurePolicy::Isolate => {
                        warn!(
                            "Stopped decoding {} at {:#x}: {}",
                            section.name, address, error
                        );
                        scan.issues.push(ScanIssue {
                            image: image.id(),
                            role: Some(role),
                            section: section.name.clone(),
                            address,
                            error,
                        });
                    }
                }
            }
        }

        Ok(scan)
    }

    /// Decodes records back to back; on failure returns where it happened
    fn decode_section(
        &self,
        image: &Image,
        role: SectionRole,
        section: &SectionData,
        spec: &LayoutSpec,
        scan: &mut ImageScan,
    ) -> std::result::Result<(), (u64, Error)> {
        let reader = ByteReader::layout(spec).try_map(move |value| match value {
            DecodedValue::Record(record) => Ok(record),
            _ => Err(Error::unexpected_value(spec.name(), "a record")),
        });
        let limit = self.config.max_records_per_section;

        let mut cursor = section.cursor();
        let mut count = 0;
        while !cursor.is_empty() {
            if limit > 0 && count >= limit {
                debug!(
                    "Record limit {} reached in section {}",
                    limit, section.name
                );
                break;
            }

            let address = cursor.address();
            let (record, next) = reader.run(cursor).map_err(|error| (address, error))?;
            if next.address() == address {
                break;
            }

            trace!("{} at {:#x} ({} bytes)", spec.name(), address, record.size());
            scan.records.push(DecodedRecord {
                image: image.id(),
                role,
                section: section.name.clone(),
                address,
                value: record,
            });
            cursor = next;
            count += 1;
        }

        debug!(
            "Decoded {} {} records from {}",
            count, role, section.name
        );
        Ok(())
    }
}
