//! Classification of section names.

use std::fmt;
use std::str::FromStr;

/// What a metadata section holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionRole {
    /// Field descriptors of nominal types
    FieldMetadata,
    /// Associated type witnesses of conformances
    AssociatedTypes,
    /// Layouts of builtin types
    BuiltinTypes,
    /// Closure capture descriptors
    Captures,
    /// Field names
    ReflectionStrings,
    /// Mangled type names
    TypeRefStrings,
    /// Protocol descriptor references
    Protocols,
    /// Protocol conformance records
    ProtocolConformances,
    /// Nominal type descriptor references
    TypeReferences,
    /// Dynamic replacement entries
    DynamicReplacements,
    /// Dynamic replacements of opaque result types
    DynamicReplacementsSome,
    /// Accessible function records
    AccessibleFunctions,
}

impl SectionRole {
    /// Every role, in table order
    pub const ALL: [SectionRole; 12] = [
        SectionRole::FieldMetadata,
        SectionRole::AssociatedTypes,
        SectionRole::BuiltinTypes,
        SectionRole::Captures,
        SectionRole::ReflectionStrings,
        SectionRole::TypeRefStrings,
        SectionRole::Protocols,
        SectionRole::ProtocolConformances,
        SectionRole::TypeReferences,
        SectionRole::DynamicReplacements,
        SectionRole::DynamicReplacementsSome,
        SectionRole::AccessibleFunctions,
    ];

    /// Short name, as used in Mach-O section names
    pub fn as_str(self) -> &'static str {
        match self {
            SectionRole::FieldMetadata => "fieldmd",
            SectionRole::AssociatedTypes => "assocty",
            SectionRole::BuiltinTypes => "builtin",
            SectionRole::Captures => "capture",
            SectionRole::ReflectionStrings => "reflstr",
            SectionRole::TypeRefStrings => "typeref",
            SectionRole::Protocols => "protos",
            SectionRole::ProtocolConformances => "proto",
            SectionRole::TypeReferences => "types",
            SectionRole::DynamicReplacements => "replace",
            SectionRole::DynamicReplacementsSome => "replac2",
            SectionRole::AccessibleFunctions => "acfuncs",
        }
    }
}

impl fmt::Display for SectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SectionRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SectionRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("unknown section role '{s}'"))
    }
}

/// One `(prefix, role)` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionEntry {
    /// Section name prefix
    pub prefix: String,
    /// Role of matching sections
    pub role: SectionRole,
}

/// Ordered, versioned mapping from section names to roles
///
/// Entries are tried in order and the first matching prefix wins, so longer
/// prefixes must come before shorter ones they extend (`__swift5_protos`
/// before `__swift5_proto`, `.sw5prtc` before `.sw5prt`). Names under a
/// claimed namespace that match no entry are reported as unrecognized;
/// everything else is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionTable {
    version: u32,
    entries: Vec<SectionEntry>,
    namespaces: Vec<String>,
    requirements: Vec<(SectionRole, Vec<SectionRole>)>,
}

impl Default for SectionTable {
    fn default() -> Self {
        Self::swift5()
    }
}

impl SectionTable {
    /// Creates an empty table
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entries: Vec::new(),
            namespaces: Vec::new(),
            requirements: Vec::new(),
        }
    }

    /// Appends an entry
    pub fn with_entry(mut self, prefix: impl Into<String>, role: SectionRole) -> Self {
        self.entries.push(SectionEntry {
            prefix: prefix.into(),
            role,
        });
        self
    }

    /// Claims a name prefix for unrecognized-section reporting
    pub fn with_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.namespaces.push(prefix.into());
        self
    }

    /// Declares sections that must be present before `role` is decoded
    pub fn with_requirement(mut self, role: SectionRole, needs: &[SectionRole]) -> Self {
        self.requirements.push((role, needs.to_vec()));
        self
    }

    /// Swift 5 reflection sections for Mach-O, ELF and COFF images
    pub fn swift5() -> Self {
        let mut table = Self::new(5)
            .with_namespace("__swift5_")
            .with_namespace("swift5_")
            .with_namespace(".sw5");

        for (short, role) in [
            ("fieldmd", SectionRole::FieldMetadata),
            ("assocty", SectionRole::AssociatedTypes),
            ("builtin", SectionRole::BuiltinTypes),
            ("capture", SectionRole::Captures),
            ("reflstr", SectionRole::ReflectionStrings),
            ("typeref", SectionRole::TypeRefStrings),
            ("protos", SectionRole::Protocols),
            ("proto", SectionRole::ProtocolConformances),
            ("types", SectionRole::TypeReferences),
            ("replace", SectionRole::DynamicReplacements),
            ("replac2", SectionRole::DynamicReplacementsSome),
            ("acfuncs", SectionRole::AccessibleFunctions),
        ] {
            table = table.with_entry(format!("__swift5_{short}"), role);
        }

        for (name, role) in [
            ("swift5_fieldmd", SectionRole::FieldMetadata),
            ("swift5_assocty", SectionRole::AssociatedTypes),
            ("swift5_builtin", SectionRole::BuiltinTypes),
            ("swift5_capture", SectionRole::Captures),
            ("swift5_reflstr", SectionRole::ReflectionStrings),
            ("swift5_typeref", SectionRole::TypeRefStrings),
            ("swift5_protocol_conformances", SectionRole::ProtocolConformances),
            ("swift5_protocols", SectionRole::Protocols),
            ("swift5_type_metadata", SectionRole::TypeReferences),
            ("swift5_replace", SectionRole::DynamicReplacements),
            ("swift5_replac2", SectionRole::DynamicReplacementsSome),
            ("swift5_accessible_functions", SectionRole::AccessibleFunctions),
        ] {
            table = table.with_entry(name, role);
        }

        for (name, role) in [
            (".sw5flmd", SectionRole::FieldMetadata),
            (".sw5asty", SectionRole::AssociatedTypes),
            (".sw5bltn", SectionRole::BuiltinTypes),
            (".sw5cptr", SectionRole::Captures),
            (".sw5rfst", SectionRole::ReflectionStrings),
            (".sw5tyrf", SectionRole::TypeRefStrings),
            (".sw5prtc", SectionRole::ProtocolConformances),
            (".sw5prt", SectionRole::Protocols),
            (".sw5tymd", SectionRole::TypeReferences),
            (".sw5repl", SectionRole::DynamicReplacements),
            (".sw5reps", SectionRole::DynamicReplacementsSome),
            (".sw5acfn", SectionRole::AccessibleFunctions),
        ] {
            table = table.with_entry(name, role);
        }
        table
    }

    /// Format version of the table
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Entries in match order
    pub fn entries(&self) -> &[SectionEntry] {
        &self.entries
    }

    /// Role of the first entry whose prefix starts `name`
    pub fn classify(&self, name: &str) -> Option<SectionRole> {
        self.entries
            .iter()
            .find(|entry| name.starts_with(&entry.prefix))
            .map(|entry| entry.role)
    }

    /// Whether `name` falls under a namespace the table claims
    pub fn claims(&self, name: &str) -> bool {
        self.namespaces.iter().any(|ns| name.starts_with(ns))
    }

    /// Sections that must be present before `role` is decoded
    pub fn requirements(&self, role: SectionRole) -> &[SectionRole] {
        self.requirements
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, needs)| needs.as_slice())
            .unwrap_or(&[])
    }
}
