//! Shapes records into Avro values by walking the working schema.
//!
//! Records carry no Avro typing, so the schema decides every leaf: integers
//! become `int`, `long` or a logical type, byte strings become `bytes`,
//! `fixed`, `decimal` or `duration`, and union branches are picked by the
//! first variant the value fits. Values outside a type's range are rejected
//! rather than truncated.

use std::collections::HashMap;

use anyhow::Result;
use apache_avro::schema::{
    DecimalSchema, EnumSchema, FixedSchema, Namespace, NamesRef, RecordSchema, ResolvedSchema, SchemaKind,
};
use apache_avro::types::Value as AvroValue;
use apache_avro::{BigDecimal, Decimal, Duration, Schema, Uuid};
use recopy_core::{Record, RecopyError};
use recopy_tx::data_uri;
use tracing::debug;

/// A schema together with its named types.
pub struct Conformer<'s> {
    schema: &'s Schema,
    names: NamesRef<'s>,
}

type Shaped = std::result::Result<AvroValue, RecopyError>;

impl<'s> Conformer<'s> {
    pub fn new(schema: &'s Schema) -> Result<Self> {
        let resolved = ResolvedSchema::try_from(schema)?;
        Ok(Self {
            schema,
            names: resolved.get_names().clone(),
        })
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// Converts `record` into a value that validates against the schema.
    pub fn conform(&self, record: &Record) -> Result<AvroValue> {
        Ok(self.shape(record, self.schema, &self.schema.namespace(), "$")?)
    }

    fn shape(&self, record: &Record, schema: &Schema, ns: &Namespace, path: &str) -> Shaped {
        let value = match (schema, record) {
            (Schema::Ref { name }, _) => {
                let name = name.fully_qualified_name(ns);
                let target = self
                    .names
                    .get(&name)
                    .copied()
                    .ok_or_else(|| mismatch(path, format!("unknown named type {}", name.fullname(None))))?;
                return self.shape(record, target, &name.namespace, path);
            }

            (Schema::Null, Record::Null) => AvroValue::Null,
            (Schema::Boolean, Record::Bool(b)) => AvroValue::Boolean(*b),
            (Schema::Int, Record::Int(n)) => AvroValue::Int(int(*n, path)?),
            (Schema::Long, Record::Int(n)) => AvroValue::Long(*n),
            (Schema::Float, Record::Float(f)) => AvroValue::Float(*f as f32),
            (Schema::Float, Record::Int(n)) => AvroValue::Float(*n as f32),
            (Schema::Double, Record::Float(f)) => AvroValue::Double(*f),
            (Schema::Double, Record::Int(n)) => AvroValue::Double(*n as f64),
            (Schema::Bytes, Record::Bytes(b)) => AvroValue::Bytes(b.clone()),
            (Schema::String, Record::String(s)) => AvroValue::String(s.clone()),
            // text that merely looked like a data URI
            (Schema::String, Record::Bytes(b)) => AvroValue::String(data_uri(b)),

            (Schema::Date, Record::Int(n)) => AvroValue::Date(int(*n, path)?),
            (Schema::TimeMillis, Record::Int(n)) => AvroValue::TimeMillis(int(*n, path)?),
            (Schema::TimeMicros, Record::Int(n)) => AvroValue::TimeMicros(*n),
            (Schema::TimestampMillis, Record::Int(n)) => AvroValue::TimestampMillis(*n),
            (Schema::TimestampMicros, Record::Int(n)) => AvroValue::TimestampMicros(*n),
            (Schema::TimestampNanos, Record::Int(n)) => AvroValue::TimestampNanos(*n),
            (Schema::LocalTimestampMillis, Record::Int(n)) => AvroValue::LocalTimestampMillis(*n),
            (Schema::LocalTimestampMicros, Record::Int(n)) => AvroValue::LocalTimestampMicros(*n),
            (Schema::LocalTimestampNanos, Record::Int(n)) => AvroValue::LocalTimestampNanos(*n),

            (Schema::Decimal(DecimalSchema { inner, .. }), Record::Bytes(b)) => {
                if let Schema::Fixed(FixedSchema { size, .. }) = inner.as_ref() {
                    if b.len() > *size {
                        return Err(mismatch(path, format!("{} decimal bytes exceed fixed size {size}", b.len())));
                    }
                }
                AvroValue::Decimal(Decimal::from(b))
            }
            (Schema::BigDecimal, Record::String(s)) => AvroValue::BigDecimal(
                s.parse::<BigDecimal>()
                    .map_err(|e| mismatch(path, format!("`{s}` is not a decimal: {e}")))?,
            ),
            (Schema::Uuid, Record::String(s)) => AvroValue::Uuid(
                s.parse::<Uuid>()
                    .map_err(|e| mismatch(path, format!("`{s}` is not a uuid: {e}")))?,
            ),
            (Schema::Duration, Record::Bytes(b)) => {
                let raw: [u8; 12] = b
                    .as_slice()
                    .try_into()
                    .map_err(|_| mismatch(path, format!("a duration is 12 bytes, found {}", b.len())))?;
                AvroValue::Duration(Duration::from(raw))
            }
            (Schema::Fixed(FixedSchema { size, .. }), Record::Bytes(b)) => {
                if b.len() != *size {
                    return Err(mismatch(path, format!("fixed size is {size}, found {} bytes", b.len())));
                }
                AvroValue::Fixed(*size, b.clone())
            }
            (Schema::Enum(EnumSchema { symbols, default, .. }), Record::String(s)) => {
                let symbol = match symbols.iter().position(|sym| sym == s) {
                    Some(_) => s,
                    None => default
                        .as_ref()
                        .ok_or_else(|| mismatch(path, format!("`{s}` is not one of {symbols:?}")))?,
                };
                let index = symbols.iter().position(|sym| sym == symbol).unwrap_or_default();
                AvroValue::Enum(index as u32, symbol.clone())
            }

            (Schema::Array(array), Record::Array(items)) => AvroValue::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| self.shape(item, &array.items, ns, &format!("{path}[{i}]")))
                    .collect::<std::result::Result<_, _>>()?,
            ),
            (Schema::Map(map), Record::Map(entries)) => AvroValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.shape(v, &map.types, ns, &format!("{path}.{k}"))?)))
                    .collect::<std::result::Result<HashMap<_, _>, RecopyError>>()?,
            ),
            (Schema::Record(record_schema), Record::Map(fields)) => self.record(record_schema, fields, ns, path)?,
            (Schema::Union(union), _) => {
                for (i, variant) in union.variants().iter().enumerate() {
                    if let Ok(value) = self.shape(record, variant, ns, path) {
                        return Ok(AvroValue::Union(i as u32, Box::new(value)));
                    }
                }
                return Err(mismatch(path, format!("{} matches no branch of the union", describe(record))));
            }

            (schema, record) => {
                return Err(mismatch(
                    path,
                    format!("expected {:?}, found {}", SchemaKind::from(schema), describe(record)),
                ))
            }
        };
        Ok(value)
    }

    /// Fields in schema order; absent fields take their default, or null
    /// when the field is nullable.
    fn record(
        &self,
        schema: &RecordSchema,
        fields: &std::collections::BTreeMap<String, Record>,
        ns: &Namespace,
        path: &str,
    ) -> Shaped {
        let ns = schema.name.fully_qualified_name(ns).namespace;
        let mut out = Vec::with_capacity(schema.fields.len());

        for field in &schema.fields {
            let field_path = format!("{path}.{}", field.name);
            let value = match (fields.get(&field.name), &field.default) {
                (Some(value), _) => self.shape(value, &field.schema, &ns, &field_path)?,
                (None, Some(default)) => self.shape(&Record::from(default.clone()), &field.schema, &ns, &field_path)?,
                (None, None) if field.is_nullable() => self.shape(&Record::Null, &field.schema, &ns, &field_path)?,
                (None, None) => return Err(mismatch(&field_path, "missing and has no default".to_string())),
            };
            out.push((field.name.clone(), value));
        }

        let extra = fields.keys().filter(|k| !schema.lookup.contains_key(*k)).count();
        if extra > 0 {
            debug!(path, extra, "fields not in the schema were dropped");
        }
        Ok(AvroValue::Record(out))
    }
}

fn int(n: i64, path: &str) -> std::result::Result<i32, RecopyError> {
    i32::try_from(n).map_err(|_| mismatch(path, format!("{n} is out of range for an avro int")))
}

fn mismatch(path: &str, reason: String) -> RecopyError {
    RecopyError::SchemaMismatch {
        field: path.to_string(),
        reason,
    }
}

fn describe(record: &Record) -> &'static str {
    match record {
        Record::Null => "null",
        Record::Bool(_) => "a boolean",
        Record::Int(_) => "an integer",
        Record::Float(_) => "a float",
        Record::String(_) => "a string",
        Record::Bytes(_) => "bytes",
        Record::Array(_) => "an array",
        Record::Map(_) => "a map",
    }
}
