//! Chained construction and validation of [`LayoutSpec`]s.

use super::{
    Alternative, ByteOrder, DiscriminantSource, Field, FlagBit, FlagSetSpec, LayoutSpec, Node,
    PointerKind, PointerTarget, ScalarKind, Scope, TrailingRepeat, MAX_POINTER_LOW_BITS,
};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for [`LayoutSpec`]
///
/// Fields are appended in call order. Problems are collected as fields are
/// added and reported by [`LayoutBuilder::build`].
#[derive(Debug)]
pub struct LayoutBuilder {
    name: String,
    byte_order: ByteOrder,
    fields: Vec<Field>,
    problems: Vec<String>,
}

impl LayoutBuilder {
    pub(super) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            byte_order: ByteOrder::default(),
            fields: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Sets the byte order of the record's integers
    pub fn byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    /// Appends an integer field
    pub fn scalar(self, name: &str, kind: ScalarKind) -> Self {
        self.push(name, Node::Scalar(kind))
    }

    /// Appends a flag-set field with named bits
    pub fn flags(self, name: &str, kind: ScalarKind, bits: &[(&str, u64)]) -> Self {
        let bits: Vec<FlagBit> = bits.iter().map(|&(n, mask)| FlagBit::new(n, mask)).collect();
        self.push(
            name,
            Node::FlagSet(FlagSetSpec {
                kind,
                bits: bits.into(),
            }),
        )
    }

    /// Appends a union whose arm is chosen by `discriminant`
    pub fn union(
        self,
        name: &str,
        discriminant: DiscriminantSource,
        alternatives: Vec<Alternative>,
    ) -> Self {
        self.push(
            name,
            Node::Union {
                discriminant,
                alternatives,
            },
        )
    }

    /// Appends an embedded record
    pub fn nested(self, name: &str, spec: Arc<LayoutSpec>) -> Self {
        self.push(name, Node::Nested(spec))
    }

    /// Appends a self-relative pointer
    pub fn pointer(self, name: &str, kind: PointerKind, target: PointerTarget) -> Self {
        self.push(name, Node::pointer(kind, target))
    }

    /// Appends a block of trailing elements
    pub fn trailing(self, name: &str, repeat: TrailingRepeat) -> Self {
        self.push(name, Node::Trailing(repeat))
    }

    /// Appends an already constructed node
    pub fn node(self, name: &str, node: Node) -> Self {
        self.push(name, node)
    }

    /// Validates the collected fields and produces the spec
    pub fn build(self) -> Result<LayoutSpec> {
        if let Some(problem) = self.problems.into_iter().next() {
            return Err(Error::invalid_layout(self.name, problem));
        }
        Ok(LayoutSpec::from_parts(self.name, self.byte_order, self.fields))
    }

    fn push(mut self, name: &str, node: Node) -> Self {
        if let Err(problem) = self.check(name, &node) {
            self.problems.push(problem);
        }
        self.fields.push(Field {
            name: Arc::from(name),
            node,
        });
        self
    }

    fn check(&self, name: &str, node: &Node) -> std::result::Result<(), String> {
        if self.fields.iter().any(|f| &*f.name == name) {
            return Err(format!("duplicate field '{name}'"));
        }

        let after_trailing = self
            .fields
            .last()
            .is_some_and(|f| matches!(f.node, Node::Trailing(_)));
        if after_trailing && !matches!(node, Node::Trailing(_)) {
            return Err(format!("fixed field '{name}' follows a trailing block"));
        }

        match node {
            Node::Nested(spec) if spec.has_trailing() => Err(format!(
                "nested record '{name}' ({}) has trailing elements",
                spec.name()
            )),
            Node::Union {
                discriminant,
                alternatives,
            } => self.check_union(name, discriminant, alternatives),
            Node::Trailing(repeat) => self.check_trailing(name, repeat),
            Node::Pointer { kind, .. } => check_pointer(name, *kind),
            _ => Ok(()),
        }
    }

    fn check_union(
        &self,
        name: &str,
        discriminant: &DiscriminantSource,
        alternatives: &[Alternative],
    ) -> std::result::Result<(), String> {
        if alternatives.is_empty() {
            return Err(format!("union '{name}' has no alternatives"));
        }
        if discriminant.scope == Scope::Local {
            match self.earlier(&discriminant.field) {
                Some(Node::Scalar(_)) | Some(Node::FlagSet(_)) => {}
                Some(_) => {
                    return Err(format!(
                        "discriminant '{}' of union '{name}' is not an integer",
                        discriminant.field
                    ))
                }
                None => {
                    return Err(format!(
                        "discriminant '{}' of union '{name}' must be declared before it",
                        discriminant.field
                    ))
                }
            }
        }

        let mut seen = HashSet::new();
        for alt in alternatives {
            if !seen.insert(alt.value) {
                return Err(format!(
                    "union '{name}' repeats discriminant value {:#x}",
                    alt.value
                ));
            }
            if alt.node.is_variable() {
                return Err(format!(
                    "alternative '{}' of union '{name}' is not fixed-size",
                    alt.name
                ));
            }
            if let Node::Pointer { kind, .. } = &alt.node {
                check_pointer(&alt.name, *kind)?;
            }
        }
        Ok(())
    }

    fn check_trailing(&self, name: &str, repeat: &TrailingRepeat) -> std::result::Result<(), String> {
        let sources = std::iter::once(&repeat.count).chain(repeat.stride.as_ref());
        for source in sources {
            match self.earlier(source) {
                Some(Node::Scalar(_)) => {}
                Some(_) => {
                    return Err(format!(
                        "size source '{source}' of trailing block '{name}' is not a scalar"
                    ))
                }
                None => {
                    return Err(format!(
                        "size source '{source}' must be declared before trailing block '{name}'"
                    ))
                }
            }
        }

        if repeat.element.fixed_size() == 0 {
            return Err(format!("trailing block '{name}' repeats an empty element"));
        }
        if repeat.stride.is_some() && repeat.element.has_trailing() {
            return Err(format!(
                "trailing block '{name}' has a stride but a variable-size element"
            ));
        }
        Ok(())
    }

    fn earlier(&self, name: &str) -> Option<&Node> {
        self.fields.iter().find(|f| &*f.name == name).map(|f| &f.node)
    }
}

fn check_pointer(name: &str, kind: PointerKind) -> std::result::Result<(), String> {
    let PointerKind::TagPacked {
        tag_bits,
        indirectable,
    } = kind
    else {
        return Ok(());
    };
    let low = u32::from(tag_bits) + u32::from(indirectable);
    if tag_bits == 0 || low > MAX_POINTER_LOW_BITS {
        return Err(format!(
            "pointer '{name}' packs {tag_bits} tag bits, expected 1 to {}",
            MAX_POINTER_LOW_BITS - u32::from(indirectable)
        ));
    }
    Ok(())
}
