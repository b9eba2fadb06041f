// crates/elspeth-core/src/core/schema.rs
// ============================================================================
// Module: Schema Contract
// Description: Frozen field-set contract governing data crossing node boundaries.
// Purpose: Sole rendezvous between producers and consumers; the audit-serialization boundary.
// Dependencies: crate::core::hashing, serde, serde_json
// ============================================================================

//! ## Overview
//! A [`SchemaContract`] is a frozen value: mode, ordered field list, lock
//! flag, and a derived `version_hash` covering every serialized byte
//! (including `locked` and each field's `source`). It is the only place row
//! shape is asserted across a node boundary; there is no dynamic
//! `row["foo"]` lookup anywhere downstream of it.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::hashing::HashError;
use crate::core::hashing::stable_hash;

/// Whitelisted field types. The contract is the audit-serialization
/// boundary, so only checkpoint-serializable types are permitted; `Decimal`
/// and user types are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Integer value.
    Int,
    /// UTF-8 string value.
    Str,
    /// Floating point value.
    Float,
    /// Boolean value.
    Bool,
    /// RFC 3339 timestamp value.
    Datetime,
    /// Explicit absence of a value (`null`).
    None,
    /// Any JSON value; used when a field's shape is intentionally unconstrained.
    Any,
}

/// Provenance of a field declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Declared explicitly by pipeline configuration.
    Declared,
    /// Inferred from an observed sample value.
    Inferred,
}

/// One field's contract: its wire identity, type, and requirement.
///
/// # Invariants
/// - `normalized_name` is a valid identifier, unique within a contract.
/// - `original_name -> normalized_name` is injective across the contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContract {
    /// Normalized (snake_case, identifier-safe) field name.
    pub normalized_name: String,
    /// Original field name as it appeared in source data.
    pub original_name: String,
    /// Declared or inferred field type.
    pub field_type: FieldType,
    /// Whether the field must be present and non-null.
    pub required: bool,
    /// Provenance of this field declaration.
    pub source: FieldSource,
}

/// Schema evolution mode.
///
/// # Invariants
/// - Merge precedence is `Fixed > Flexible > Observed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    /// No declared requirements; extras permitted; contract grows freely.
    Observed,
    /// As `Fixed` for declared fields; extras permitted.
    Flexible,
    /// Required fields must be present and type-match; extras rejected.
    Fixed,
}

/// A single validation violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// A required field was absent or null.
    MissingField {
        /// Normalized name of the missing field.
        normalized_name: String,
    },
    /// A present field's value did not match its declared type.
    TypeMismatch {
        /// Normalized name of the field.
        normalized_name: String,
        /// Declared field type.
        expected: FieldType,
    },
    /// A field not declared in the contract was present on the row.
    ExtraField {
        /// Name of the undeclared field as it appeared on the row.
        name: String,
    },
}

/// Errors raised by schema contract operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    /// `normalized_name` is not a valid identifier.
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),
    /// `normalized_name` or `original_name` was already present in the contract.
    #[error("field '{0}' already exists in the contract")]
    DuplicateField(String),
    /// `with_field`/`with_locked` was called on a locked contract.
    #[error("contract is locked and cannot accept new fields")]
    Locked,
    /// A sample value used for type inference was a non-finite number.
    #[error("non-finite numeric sample for field '{0}'")]
    NonFiniteSample(String),
    /// Canonical hashing failed while computing `version_hash`.
    #[error("failed to compute contract hash: {0}")]
    Hashing(#[from] HashError),
    /// `from_checkpoint` found a `version_hash` that did not match the
    /// recomputed hash of the embedded fields. Tier-1: fatal, no fallback.
    #[error("checkpoint contract hash mismatch: expected {expected}, recomputed {actual}")]
    CheckpointIntegrity {
        /// Hash embedded in the checkpoint payload.
        expected: String,
        /// Hash recomputed from the embedded fields.
        actual: String,
    },
}

/// Errors raised merging two contracts at a coalesce/fork convergence point.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractMergeError {
    /// Both branches declared the same field with incompatible types.
    #[error("field '{normalized_name}' has conflicting types: {left:?} vs {right:?}")]
    ConflictingTypes {
        /// Normalized field name in conflict.
        normalized_name: String,
        /// Type declared by the left-hand contract.
        left: FieldType,
        /// Type declared by the right-hand contract.
        right: FieldType,
    },
}

/// Canonical, hashable form used for `version_hash` computation and
/// checkpoint serialization. Field order is always normalized-name sorted,
/// so this is a pure function of contract content.
#[derive(Debug, Serialize, Deserialize)]
struct CanonicalForm<'a> {
    mode: SchemaMode,
    locked: bool,
    fields: &'a [FieldContract],
}

/// Wire format produced by [`SchemaContract::to_checkpoint_format`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointedContract {
    /// Schema mode.
    pub mode: SchemaMode,
    /// Ordered field contracts (sorted by normalized name).
    pub fields: Vec<FieldContract>,
    /// Lock flag.
    pub locked: bool,
    /// Stable 128-bit-prefix hex hash covering mode, locked, and every field.
    pub version_hash: String,
}

/// Frozen field-set contract: the sole rendezvous between producers and
/// consumers of row data crossing a node boundary.
#[derive(Debug, Clone)]
pub struct SchemaContract {
    mode: SchemaMode,
    fields: Vec<FieldContract>,
    locked: bool,
    version_hash: String,
    by_normalized: HashMap<String, usize>,
    by_original: HashMap<String, String>,
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Truncates a full hex SHA-256 digest to its stable 128-bit (32 hex char) prefix.
fn truncate_version_hash(full: &str) -> String {
    full.chars().take(32).collect()
}

impl SchemaContract {
    /// Creates a new, unlocked, empty contract in the given mode.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Hashing`] if the initial (empty) canonical
    /// form cannot be hashed, which only happens on an internal bug.
    pub fn new(mode: SchemaMode) -> Result<Self, ContractError> {
        Self::from_fields(mode, Vec::new(), false)
    }

    fn from_fields(
        mode: SchemaMode,
        mut fields: Vec<FieldContract>,
        locked: bool,
    ) -> Result<Self, ContractError> {
        fields.sort_by(|a, b| a.normalized_name.cmp(&b.normalized_name));
        let version_hash = truncate_version_hash(&stable_hash(&CanonicalForm {
            mode,
            locked,
            fields: &fields,
        })?);
        let mut by_normalized = HashMap::new();
        let mut by_original = HashMap::new();
        for (idx, field) in fields.iter().enumerate() {
            by_normalized.insert(field.normalized_name.clone(), idx);
            by_original.insert(field.original_name.clone(), field.normalized_name.clone());
        }
        Ok(Self {
            mode,
            fields,
            locked,
            version_hash,
            by_normalized,
            by_original,
        })
    }

    /// Schema mode.
    #[must_use]
    pub const fn mode(&self) -> SchemaMode {
        self.mode
    }

    /// Whether the contract rejects new fields.
    #[must_use]
    pub const fn locked(&self) -> bool {
        self.locked
    }

    /// Stable 128-bit-prefix hex hash over mode, locked, and every field.
    #[must_use]
    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }

    /// All fields, sorted by normalized name.
    #[must_use]
    pub fn fields(&self) -> &[FieldContract] {
        &self.fields
    }

    /// Resolves an original or normalized name to its normalized form.
    #[must_use]
    pub fn find_name(&self, name: &str) -> Option<&str> {
        if self.by_normalized.contains_key(name) {
            return Some(
                self.fields[self.by_normalized[name]].normalized_name.as_str(),
            );
        }
        self.by_original.get(name).map(String::as_str)
    }

    /// Resolves an original or normalized name to its normalized form.
    ///
    /// # Errors
    ///
    /// Returns `None` wrapped as an error-like absence is not applicable;
    /// callers wanting a hard failure should treat `None` as "unknown name".
    #[must_use]
    pub fn resolve_name(&self, name: &str) -> Option<&str> {
        self.find_name(name)
    }

    /// Looks up a field by its normalized or original name.
    #[must_use]
    pub fn find_field(&self, name: &str) -> Option<&FieldContract> {
        let normalized = self.find_name(name)?;
        self.by_normalized.get(normalized).map(|&idx| &self.fields[idx])
    }

    /// Looks up a field by its normalized name; panics in debug builds are
    /// never reached because this returns `None` on a lookup miss.
    #[must_use]
    pub fn get_field(&self, normalized_name: &str) -> Option<&FieldContract> {
        self.by_normalized
            .get(normalized_name)
            .map(|&idx| &self.fields[idx])
    }

    /// Infers a [`FieldType`] from a JSON sample value.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::NonFiniteSample`] if the sample is a
    /// non-finite number.
    fn infer_type(normalized_name: &str, sample: &Value) -> Result<FieldType, ContractError> {
        match sample {
            Value::Null => Ok(FieldType::None),
            Value::Bool(_) => Ok(FieldType::Bool),
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    if !f.is_finite() {
                        return Err(ContractError::NonFiniteSample(normalized_name.to_string()));
                    }
                }
                if n.is_i64() || n.is_u64() {
                    Ok(FieldType::Int)
                } else {
                    Ok(FieldType::Float)
                }
            }
            Value::String(_) => Ok(FieldType::Str),
            Value::Array(_) | Value::Object(_) => Ok(FieldType::Any),
        }
    }

    /// Returns a new contract with one additional field, inferring its type
    /// from `sample_value`. Only permitted on unlocked contracts; rejects
    /// duplicate normalized or original names even though the contract is
    /// unlocked (no silent overwrite).
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Locked`], [`ContractError::InvalidIdentifier`],
    /// [`ContractError::DuplicateField`], or [`ContractError::NonFiniteSample`].
    pub fn with_field(
        &self,
        normalized_name: impl Into<String>,
        original_name: impl Into<String>,
        sample_value: &Value,
        required: bool,
    ) -> Result<Self, ContractError> {
        let normalized_name = normalized_name.into();
        let original_name = original_name.into();
        let field_type = Self::infer_type(&normalized_name, sample_value)?;
        self.with_typed_field(
            normalized_name,
            original_name,
            field_type,
            required,
            FieldSource::Inferred,
        )
    }

    /// Returns a new contract with one additional field of an explicitly
    /// provided type. Use this for types (`Datetime`, `Any`) that cannot be
    /// inferred from a JSON sample, or to declare a field without a sample.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Locked`], [`ContractError::InvalidIdentifier`],
    /// or [`ContractError::DuplicateField`].
    pub fn with_typed_field(
        &self,
        normalized_name: impl Into<String>,
        original_name: impl Into<String>,
        field_type: FieldType,
        required: bool,
        source: FieldSource,
    ) -> Result<Self, ContractError> {
        if self.locked {
            return Err(ContractError::Locked);
        }
        let normalized_name = normalized_name.into();
        let original_name = original_name.into();
        if !is_valid_identifier(&normalized_name) {
            return Err(ContractError::InvalidIdentifier(normalized_name));
        }
        if self.by_normalized.contains_key(&normalized_name) {
            return Err(ContractError::DuplicateField(normalized_name));
        }
        if self.by_original.contains_key(&original_name) {
            return Err(ContractError::DuplicateField(original_name));
        }
        let mut fields = self.fields.clone();
        fields.push(FieldContract {
            normalized_name,
            original_name,
            field_type,
            required,
            source,
        });
        Self::from_fields(self.mode, fields, self.locked)
    }

    /// Returns a new, locked copy of this contract.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Hashing`] only on an internal bug.
    pub fn with_locked(&self) -> Result<Self, ContractError> {
        Self::from_fields(self.mode, self.fields.clone(), true)
    }

    /// Validates a row against this contract, returning every violation
    /// found (empty means the row is valid).
    #[must_use]
    pub fn validate(&self, row: &serde_json::Map<String, Value>) -> Vec<Violation> {
        let mut violations = Vec::new();
        if matches!(self.mode, SchemaMode::Observed) {
            return violations;
        }
        for field in &self.fields {
            let present = row.get(&field.original_name).or_else(|| row.get(&field.normalized_name));
            match present {
                None => {
                    if field.required {
                        violations.push(Violation::MissingField {
                            normalized_name: field.normalized_name.clone(),
                        });
                    }
                }
                Some(Value::Null) => {
                    if field.required {
                        violations.push(Violation::TypeMismatch {
                            normalized_name: field.normalized_name.clone(),
                            expected: field.field_type,
                        });
                    }
                }
                Some(value) => {
                    if !type_matches(field.field_type, value) {
                        violations.push(Violation::TypeMismatch {
                            normalized_name: field.normalized_name.clone(),
                            expected: field.field_type,
                        });
                    }
                }
            }
        }
        if matches!(self.mode, SchemaMode::Fixed) {
            let declared: std::collections::HashSet<&str> = self
                .fields
                .iter()
                .flat_map(|f| [f.original_name.as_str(), f.normalized_name.as_str()])
                .collect();
            for key in row.keys() {
                if !declared.contains(key.as_str()) {
                    violations.push(Violation::ExtraField { name: key.clone() });
                }
            }
        }
        violations
    }

    /// Merges this contract with another at a coalesce/fork convergence
    /// point. Mode precedence is `Fixed > Flexible > Observed`; `locked` is
    /// the logical OR; a field present in only one branch becomes
    /// `required = false`; `source = Declared` wins over `Inferred`.
    ///
    /// # Errors
    ///
    /// Returns [`ContractMergeError::ConflictingTypes`] when both branches
    /// declare the same field with different types.
    pub fn merge(&self, other: &Self) -> Result<Self, ContractMergeError> {
        let mode = self.mode.max(other.mode);
        let locked = self.locked || other.locked;
        let mut merged: HashMap<String, FieldContract> = HashMap::new();
        for field in &self.fields {
            merged.insert(field.normalized_name.clone(), field.clone());
        }
        for field in &other.fields {
            match merged.get(&field.normalized_name) {
                None => {
                    let mut f = field.clone();
                    f.required = false;
                    merged.insert(field.normalized_name.clone(), f);
                }
                Some(existing) => {
                    if existing.field_type != field.field_type {
                        return Err(ContractMergeError::ConflictingTypes {
                            normalized_name: field.normalized_name.clone(),
                            left: existing.field_type,
                            right: field.field_type,
                        });
                    }
                    let source = if existing.source == FieldSource::Declared
                        || field.source == FieldSource::Declared
                    {
                        FieldSource::Declared
                    } else {
                        FieldSource::Inferred
                    };
                    let required = existing.required && field.required;
                    merged.insert(
                        field.normalized_name.clone(),
                        FieldContract {
                            normalized_name: field.normalized_name.clone(),
                            original_name: existing.original_name.clone(),
                            field_type: existing.field_type,
                            required,
                            source,
                        },
                    );
                }
            }
        }
        // Fields present only in `self` (not visited above) still need the
        // required=false downgrade, since merging means "either branch".
        let mut fields: Vec<FieldContract> = Vec::with_capacity(merged.len());
        for field in merged.into_values() {
            let only_in_one = !(self.by_normalized.contains_key(&field.normalized_name)
                && other.by_normalized.contains_key(&field.normalized_name));
            let mut f = field;
            if only_in_one {
                f.required = false;
            }
            fields.push(f);
        }
        // `from_fields` only fails if canonical hashing fails, which cannot
        // happen for a field set built from two already-valid contracts.
        Ok(Self::from_fields(mode, fields, locked)
            .expect("hashing a merged, already-valid field set cannot fail"))
    }

    /// Serializes this contract to its checkpoint wire format.
    #[must_use]
    pub fn to_checkpoint_format(&self) -> CheckpointedContract {
        CheckpointedContract {
            mode: self.mode,
            fields: self.fields.clone(),
            locked: self.locked,
            version_hash: self.version_hash.clone(),
        }
    }

    /// Reconstructs a contract from its checkpoint wire format, validating
    /// the embedded `version_hash`. Tier-1 rule: a missing or mismatched
    /// hash is corruption, not a legacy format to tolerate.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::CheckpointIntegrity`] if the recomputed
    /// hash does not match `data.version_hash`, or a construction error if
    /// the embedded fields are themselves invalid.
    pub fn from_checkpoint(data: CheckpointedContract) -> Result<Self, ContractError> {
        let rebuilt = Self::from_fields(data.mode, data.fields, data.locked)?;
        if rebuilt.version_hash != data.version_hash {
            return Err(ContractError::CheckpointIntegrity {
                expected: data.version_hash,
                actual: rebuilt.version_hash,
            });
        }
        Ok(rebuilt)
    }
}

impl PartialEq for SchemaContract {
    fn eq(&self, other: &Self) -> bool {
        self.version_hash == other.version_hash
            && self.mode == other.mode
            && self.locked == other.locked
            && self.fields == other.fields
    }
}
impl Eq for SchemaContract {}

fn type_matches(field_type: FieldType, value: &Value) -> bool {
    match field_type {
        FieldType::Int => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
        FieldType::Str => value.is_string(),
        FieldType::Bool => value.is_boolean(),
        FieldType::Datetime => value.is_string(),
        FieldType::None => value.is_null(),
        FieldType::Any => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixed_contract() -> SchemaContract {
        SchemaContract::new(SchemaMode::Fixed)
            .expect("empty contract")
            .with_field("id", "id", &json!(1), true)
            .expect("add id")
            .with_field("name", "Name", &json!("x"), false)
            .expect("add name")
    }

    #[test]
    fn valid_row_has_no_violations() {
        let contract = fixed_contract();
        let row = json!({"id": 1, "Name": "hi"}).as_object().cloned().unwrap();
        assert!(contract.validate(&row).is_empty());
    }

    #[test]
    fn missing_required_field_is_a_violation() {
        let contract = fixed_contract();
        let row = json!({"Name": "hi"}).as_object().cloned().unwrap();
        let violations = contract.validate(&row);
        assert_eq!(
            violations,
            vec![Violation::MissingField {
                normalized_name: "id".to_string()
            }]
        );
    }

    #[test]
    fn required_field_rejects_null_regardless_of_type() {
        let contract = fixed_contract();
        let row = json!({"id": null, "Name": "hi"}).as_object().cloned().unwrap();
        let violations = contract.validate(&row);
        assert_eq!(
            violations,
            vec![Violation::TypeMismatch {
                normalized_name: "id".to_string(),
                expected: FieldType::Int
            }]
        );
    }

    #[test]
    fn optional_field_accepts_null() {
        let contract = fixed_contract();
        let row = json!({"id": 1, "Name": null}).as_object().cloned().unwrap();
        assert!(contract.validate(&row).is_empty());
    }

    #[test]
    fn fixed_rejects_extra_fields() {
        let contract = fixed_contract();
        let row = json!({"id": 1, "Name": "hi", "extra": true})
            .as_object()
            .cloned()
            .unwrap();
        let violations = contract.validate(&row);
        assert_eq!(
            violations,
            vec![Violation::ExtraField {
                name: "extra".to_string()
            }]
        );
    }

    #[test]
    fn flexible_permits_extra_fields() {
        let contract = SchemaContract::new(SchemaMode::Flexible)
            .expect("empty")
            .with_field("id", "id", &json!(1), true)
            .expect("add id");
        let row = json!({"id": 1, "extra": true}).as_object().cloned().unwrap();
        assert!(contract.validate(&row).is_empty());
    }

    #[test]
    fn duplicate_field_rejected_even_unlocked() {
        let contract = fixed_contract();
        let err = contract
            .with_field("id", "id2", &json!(2), true)
            .expect_err("duplicate normalized name must fail");
        assert_eq!(err, ContractError::DuplicateField("id".to_string()));
    }

    #[test]
    fn locked_contract_rejects_new_fields() {
        let contract = fixed_contract().with_locked().expect("lock");
        let err = contract
            .with_field("extra", "extra", &json!(1), false)
            .expect_err("locked must reject");
        assert_eq!(err, ContractError::Locked);
    }

    #[test]
    fn version_hash_changes_on_tamper() {
        let contract = fixed_contract();
        let mut checkpoint = contract.to_checkpoint_format();
        checkpoint.locked = true;
        let err = SchemaContract::from_checkpoint(checkpoint).expect_err("tamper must fail");
        assert!(matches!(err, ContractError::CheckpointIntegrity { .. }));
    }

    #[test]
    fn checkpoint_roundtrip_preserves_contract() {
        let contract = fixed_contract();
        let restored = SchemaContract::from_checkpoint(contract.to_checkpoint_format())
            .expect("roundtrip must succeed");
        assert_eq!(contract, restored);
    }

    #[test]
    fn merge_downgrades_single_branch_fields_to_optional() {
        let a = SchemaContract::new(SchemaMode::Fixed)
            .expect("empty")
            .with_field("id", "id", &json!(1), true)
            .expect("add id");
        let b = SchemaContract::new(SchemaMode::Fixed)
            .expect("empty")
            .with_field("id", "id", &json!(1), true)
            .expect("add id")
            .with_field("score", "score", &json!(1.0), true)
            .expect("add score");
        let merged = a.merge(&b).expect("merge");
        let score = merged.get_field("score").expect("score present");
        assert!(!score.required);
        let id = merged.get_field("id").expect("id present");
        assert!(id.required);
    }

    #[test]
    fn merge_rejects_conflicting_types() {
        let a = SchemaContract::new(SchemaMode::Fixed)
            .expect("empty")
            .with_field("id", "id", &json!(1), true)
            .expect("add id");
        let b = SchemaContract::new(SchemaMode::Fixed)
            .expect("empty")
            .with_field("id", "id", &json!("x"), true)
            .expect("add id");
        let err = a.merge(&b).expect_err("conflicting types must fail");
        assert!(matches!(err, ContractMergeError::ConflictingTypes { .. }));
    }

    #[test]
    fn mode_precedence_picks_the_strictest_mode() {
        let fixed = SchemaContract::new(SchemaMode::Fixed).expect("empty");
        let observed = SchemaContract::new(SchemaMode::Observed).expect("empty");
        assert_eq!(fixed.merge(&observed).expect("merge").mode(), SchemaMode::Fixed);
    }

    #[test]
    fn invalid_identifier_rejected() {
        let contract = SchemaContract::new(SchemaMode::Fixed).expect("empty");
        let err = contract
            .with_field("1bad", "1bad", &json!(1), true)
            .expect_err("invalid identifier must fail");
        assert_eq!(err, ContractError::InvalidIdentifier("1bad".to_string()));
    }
}
