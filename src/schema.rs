//! Schema types for describing provider, resource and data source structure.
//!
//! Maps are ordered so that a schema enumerated twice in one run, or across
//! runs, produces the same output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::generated;

/// The type of an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    /// A string value.
    String,
    /// A 64-bit integer.
    Int64,
    /// A 64-bit floating point number.
    Float64,
    /// A boolean value.
    Bool,
    /// A list of values of a single type.
    List(Box<AttributeType>),
    /// A set of unique values of a single type.
    Set(Box<AttributeType>),
    /// A map from string keys to values of a single type.
    Map(Box<AttributeType>),
    /// A dynamic type that can hold any value.
    Dynamic,
}

impl AttributeType {
    /// Create a list type.
    pub fn list(element_type: AttributeType) -> Self {
        Self::List(Box::new(element_type))
    }

    /// Create a set type.
    pub fn set(element_type: AttributeType) -> Self {
        Self::Set(Box::new(element_type))
    }

    /// Create a map type.
    pub fn map(element_type: AttributeType) -> Self {
        Self::Map(Box::new(element_type))
    }
}

/// Describes how an attribute can be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AttributeFlags {
    /// The attribute is required in configuration.
    pub required: bool,
    /// The attribute is optional in configuration.
    pub optional: bool,
    /// The attribute is computed by the provider (read-only).
    pub computed: bool,
    /// The attribute is sensitive and should be hidden in logs/UI.
    pub sensitive: bool,
}

impl AttributeFlags {
    /// Flags for a required attribute.
    pub fn required() -> Self {
        Self {
            required: true,
            ..Default::default()
        }
    }

    /// Flags for an optional attribute.
    pub fn optional() -> Self {
        Self {
            optional: true,
            ..Default::default()
        }
    }

    /// Flags for a computed attribute.
    pub fn computed() -> Self {
        Self {
            computed: true,
            ..Default::default()
        }
    }

    /// Flags for an attribute that may be set but is otherwise filled in by the provider.
    pub fn optional_computed() -> Self {
        Self {
            optional: true,
            computed: true,
            ..Default::default()
        }
    }
}

/// Describes a single attribute in a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The type of the attribute.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Flags describing how the attribute can be used.
    #[serde(flatten)]
    pub flags: AttributeFlags,
    /// Human-readable description of the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// If set, changing this attribute forces resource replacement.
    #[serde(default)]
    pub force_new: bool,
    /// Default value for the attribute.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl Attribute {
    /// Create a new attribute with the given type and flags.
    pub fn new(attr_type: AttributeType, flags: AttributeFlags) -> Self {
        Self {
            attr_type,
            flags,
            description: None,
            force_new: false,
            default: None,
        }
    }

    /// Create a required string attribute.
    pub fn required_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::required())
    }

    /// Create an optional string attribute.
    pub fn optional_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::optional())
    }

    /// Create a computed string attribute.
    pub fn computed_string() -> Self {
        Self::new(AttributeType::String, AttributeFlags::computed())
    }

    /// Create an optional bool attribute.
    pub fn optional_bool() -> Self {
        Self::new(AttributeType::Bool, AttributeFlags::optional())
    }

    /// Set the description for this attribute.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark this attribute as forcing resource replacement when changed.
    pub fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }

    /// Set a default value for this attribute.
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark this attribute as sensitive.
    pub fn sensitive(mut self) -> Self {
        self.flags.sensitive = true;
        self
    }
}

/// The nesting mode for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockNestingMode {
    /// At most one nested block.
    #[default]
    Single,
    /// Zero or more nested blocks, ordered.
    List,
    /// Zero or more nested blocks, unordered and unique.
    Set,
    /// Nested blocks keyed by string.
    Map,
}

/// A block of attributes and nested blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Block {
    /// The attributes within this block.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Attribute>,
    /// Nested blocks within this block.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub blocks: BTreeMap<String, NestedBlock>,
    /// Human-readable description of the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Block {
    /// Create a new empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attribute to this block.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.attributes.insert(name.into(), attr);
        self
    }

    /// Add a nested block to this block.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.blocks.insert(name.into(), block);
        self
    }

    /// Set the description for this block.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A nested block with its nesting mode and constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestedBlock {
    /// The block definition.
    #[serde(flatten)]
    pub block: Block,
    /// How the block is nested.
    #[serde(default)]
    pub nesting_mode: BlockNestingMode,
    /// Minimum number of blocks required.
    #[serde(default)]
    pub min_items: u32,
    /// Maximum number of blocks allowed (0 = unlimited).
    #[serde(default)]
    pub max_items: u32,
}

impl NestedBlock {
    fn with_mode(block: Block, nesting_mode: BlockNestingMode, max_items: u32) -> Self {
        Self {
            block,
            nesting_mode,
            min_items: 0,
            max_items,
        }
    }

    /// A single nested block (0 or 1 allowed).
    pub fn single(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::Single, 1)
    }

    /// A list of nested blocks.
    pub fn list(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::List, 0)
    }

    /// A set of nested blocks.
    pub fn set(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::Set, 0)
    }

    /// A map of nested blocks.
    pub fn map(block: Block) -> Self {
        Self::with_mode(block, BlockNestingMode::Map, 0)
    }

    /// Set the minimum number of blocks required.
    pub fn with_min_items(mut self, min: u32) -> Self {
        self.min_items = min;
        self
    }

    /// Set the maximum number of blocks allowed.
    pub fn with_max_items(mut self, max: u32) -> Self {
        self.max_items = max;
        self
    }
}

/// Schema for a resource, a data source, or the provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Schema {
    /// The version of this schema (for state upgrades).
    #[serde(default)]
    pub version: u64,
    /// The root block containing all attributes and nested blocks.
    #[serde(flatten)]
    pub block: Block,
}

impl Schema {
    /// Create a new schema with the given version.
    pub fn new(version: u64) -> Self {
        Self {
            version,
            block: Block::new(),
        }
    }

    /// Create a schema at version 0.
    pub fn v0() -> Self {
        Self::new(0)
    }

    /// Add an attribute to the schema.
    pub fn with_attribute(mut self, name: impl Into<String>, attr: Attribute) -> Self {
        self.block.attributes.insert(name.into(), attr);
        self
    }

    /// Add a nested block to the schema.
    pub fn with_block(mut self, name: impl Into<String>, block: NestedBlock) -> Self {
        self.block.blocks.insert(name.into(), block);
        self
    }

    /// Whether changing the named top-level attribute forces replacement.
    pub fn forces_new(&self, name: &str) -> bool {
        self.block
            .attributes
            .get(name)
            .map(|attr| attr.force_new)
            .unwrap_or(false)
    }
}

/// The full schema a provider advertises to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProviderSchema {
    /// Schema for provider configuration.
    #[serde(default)]
    pub provider: Schema,
    /// Schemas for each resource type.
    #[serde(default)]
    pub resources: BTreeMap<String, Schema>,
    /// Schemas for each data source type.
    #[serde(default)]
    pub data_sources: BTreeMap<String, Schema>,
}

impl ProviderSchema {
    /// Create a new empty provider schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider configuration schema.
    pub fn with_provider_config(mut self, schema: Schema) -> Self {
        self.provider = schema;
        self
    }

    /// Add a resource schema.
    pub fn with_resource(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.resources.insert(name.into(), schema);
        self
    }

    /// Add a data source schema.
    pub fn with_data_source(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.data_sources.insert(name.into(), schema);
        self
    }
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// An error that prevents the operation from completing.
    Error,
    /// A warning that doesn't prevent the operation.
    Warning,
}

/// A diagnostic message returned to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The severity of the diagnostic.
    pub severity: DiagnosticSeverity,
    /// A short summary of the issue.
    pub summary: String,
    /// A detailed description of the issue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// The attribute path where the issue occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

impl Diagnostic {
    /// Create an error diagnostic.
    pub fn error(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Create a warning diagnostic.
    pub fn warning(summary: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Warning,
            summary: summary.into(),
            detail: None,
            attribute: None,
        }
    }

    /// Add detail to this diagnostic.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the attribute path for this diagnostic.
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Whether this diagnostic is an error.
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// Whether any diagnostic in the list is an error.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

impl From<Diagnostic> for generated::Diagnostic {
    fn from(d: Diagnostic) -> Self {
        let severity = match d.severity {
            DiagnosticSeverity::Error => generated::diagnostic::Severity::Error,
            DiagnosticSeverity::Warning => generated::diagnostic::Severity::Warning,
        };
        Self {
            severity: severity as i32,
            summary: d.summary,
            detail: d.detail.unwrap_or_default(),
            attribute: d.attribute.unwrap_or_default(),
        }
    }
}

impl From<&Block> for generated::Block {
    fn from(block: &Block) -> Self {
        Self {
            attributes: block
                .attributes
                .iter()
                .map(|(name, attr)| generated::Attribute {
                    name: name.clone(),
                    r#type: serde_json::to_vec(&attr.attr_type).unwrap_or_default(),
                    required: attr.flags.required,
                    optional: attr.flags.optional,
                    computed: attr.flags.computed,
                    sensitive: attr.flags.sensitive,
                    description: attr.description.clone().unwrap_or_default(),
                    force_new: attr.force_new,
                    default_value: attr
                        .default
                        .as_ref()
                        .map(|v| serde_json::to_vec(v).unwrap_or_default())
                        .unwrap_or_default(),
                })
                .collect(),
            block_types: block
                .blocks
                .iter()
                .map(|(name, nested)| {
                    let mode = match nested.nesting_mode {
                        BlockNestingMode::Single => generated::nested_block::NestingMode::Single,
                        BlockNestingMode::List => generated::nested_block::NestingMode::List,
                        BlockNestingMode::Set => generated::nested_block::NestingMode::Set,
                        BlockNestingMode::Map => generated::nested_block::NestingMode::Map,
                    };
                    generated::NestedBlock {
                        type_name: name.clone(),
                        block: Some((&nested.block).into()),
                        nesting_mode: mode as i32,
                        min_items: nested.min_items as i32,
                        max_items: nested.max_items as i32,
                    }
                })
                .collect(),
            description: block.description.clone().unwrap_or_default(),
        }
    }
}

impl From<&Schema> for generated::Schema {
    fn from(schema: &Schema) -> Self {
        Self {
            version: schema.version as i64,
            block: Some((&schema.block).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_builder() {
        let schema = Schema::v0()
            .with_attribute("name", Attribute::required_string().with_force_new())
            .with_attribute("id", Attribute::computed_string())
            .with_block(
                "extension",
                NestedBlock::list(
                    Block::new().with_attribute("oid", Attribute::required_string()),
                )
                .with_max_items(8),
            );

        assert_eq!(schema.version, 0);
        assert!(schema.forces_new("name"));
        assert!(!schema.forces_new("id"));
        assert!(!schema.forces_new("missing"));
        assert_eq!(schema.block.blocks["extension"].max_items, 8);
    }

    #[test]
    fn test_attribute_flags() {
        let optional_computed = AttributeFlags::optional_computed();
        assert!(!optional_computed.required);
        assert!(optional_computed.optional);
        assert!(optional_computed.computed);

        let attr = Attribute::required_string().sensitive();
        assert!(attr.flags.required);
        assert!(attr.flags.sensitive);
    }

    #[test]
    fn test_diagnostic_helpers() {
        let diagnostics = vec![
            Diagnostic::warning("deprecated"),
            Diagnostic::error("Invalid certname")
                .with_detail("must not be empty")
                .with_attribute("name"),
        ];
        assert!(has_errors(&diagnostics));
        assert!(!has_errors(&diagnostics[..1]));

        let proto: generated::Diagnostic = diagnostics[1].clone().into();
        assert_eq!(proto.severity, generated::diagnostic::Severity::Error as i32);
        assert_eq!(proto.detail, "must not be empty");
        assert_eq!(proto.attribute, "name");
    }

    #[test]
    fn test_schema_to_proto_is_ordered() {
        let schema = Schema::new(2)
            .with_attribute("zeta", Attribute::optional_string())
            .with_attribute("alpha", Attribute::required_string().with_force_new())
            .with_block("nested", NestedBlock::single(Block::new()));

        let proto: generated::Schema = (&schema).into();
        assert_eq!(proto.version, 2);
        let block = proto.block.expect("block is always set");
        let names: Vec<_> = block.attributes.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(block.attributes[0].force_new);
        assert_eq!(block.attributes[0].r#type, br#""string""#.to_vec());
        assert_eq!(
            block.block_types[0].nesting_mode,
            generated::nested_block::NestingMode::Single as i32
        );
        assert_eq!(block.block_types[0].max_items, 1);
    }
}
