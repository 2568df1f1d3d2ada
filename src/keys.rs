//! Cache key generation
//!
//! Every key this crate writes is built here. Three shapes exist:
//!
//! - table key: `{prefix}_{ns}_table_{table}`, holds a table's generation token
//! - multi key: `{prefix}_{ns}_multi_{hash(tokens)}`, holds the token for a table set
//! - result key: `{prefix}_{ns}_query_{generation}.{hash(query)}`, holds a cached result
//!
//! Hashing is SHA-256 truncated to 128 bits with no process-local salt, so
//! independent processes derive identical keys for identical inputs.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::CacheConfig;

/// Components longer than this are truncated and suffixed with a hash of the remainder.
const MAX_COMPONENT_LEN: usize = 100;
/// Characters kept verbatim when a component is truncated.
const TRUNCATED_HEAD_LEN: usize = 68;
/// Bytes of digest kept for key fragments.
const DIGEST_BYTES: usize = 16;

/// A canonical value that participates in a key hash.
///
/// Conversions normalize representation: every integer width becomes `Int`,
/// every string type becomes `Text`. Sequences are flattened when hashed.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i128),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Seq(Vec<KeyPart>),
}

impl KeyPart {
    fn write_canonical(&self, hasher: &mut Sha256) {
        match self {
            KeyPart::Seq(items) => {
                for item in items {
                    item.write_canonical(hasher);
                }
            }
            KeyPart::Null => write_leaf(hasher, b'n', &[]),
            KeyPart::Bool(b) => write_leaf(hasher, b'b', &[u8::from(*b)]),
            KeyPart::Int(i) => write_leaf(hasher, b'i', i.to_string().as_bytes()),
            KeyPart::Float(f) => {
                // -0.0 and 0.0 are the same parameter
                let f = if *f == 0.0 { 0.0 } else { *f };
                write_leaf(hasher, b'f', &f.to_bits().to_be_bytes())
            }
            KeyPart::Text(s) => write_leaf(hasher, b's', s.as_bytes()),
            KeyPart::Bytes(b) => write_leaf(hasher, b'x', b),
        }
    }
}

fn write_leaf(hasher: &mut Sha256, tag: u8, bytes: &[u8]) {
    hasher.update([tag]);
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

macro_rules! int_key_part {
    ($($t:ty),*) => {
        $(impl From<$t> for KeyPart {
            fn from(v: $t) -> Self {
                KeyPart::Int(i128::from(v))
            }
        })*
    };
}

int_key_part!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<usize> for KeyPart {
    fn from(v: usize) -> Self {
        KeyPart::Int(v as i128)
    }
}

impl From<bool> for KeyPart {
    fn from(v: bool) -> Self {
        KeyPart::Bool(v)
    }
}

impl From<f64> for KeyPart {
    fn from(v: f64) -> Self {
        KeyPart::Float(v)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Text(v.to_owned())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Text(v)
    }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(v: Option<T>) -> Self {
        v.map_or(KeyPart::Null, Into::into)
    }
}

impl<T: Into<KeyPart>> From<Vec<T>> for KeyPart {
    fn from(v: Vec<T>) -> Self {
        KeyPart::Seq(v.into_iter().map(Into::into).collect())
    }
}

impl From<&serde_json::Value> for KeyPart {
    fn from(v: &serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Number(n) => n
                .as_i64()
                .map(KeyPart::from)
                .or_else(|| n.as_u64().map(KeyPart::from))
                .unwrap_or_else(|| KeyPart::Float(n.as_f64().unwrap_or(f64::NAN))),
            Value::String(s) => KeyPart::Text(s.clone()),
            Value::Array(items) => KeyPart::Seq(items.iter().map(KeyPart::from).collect()),
            Value::Object(map) => {
                let mut pairs: Vec<_> = map.iter().collect();
                pairs.sort_by(|a, b| a.0.cmp(b.0));
                KeyPart::Seq(
                    pairs
                        .into_iter()
                        .map(|(k, v)| KeyPart::Seq(vec![KeyPart::from(k.as_str()), v.into()]))
                        .collect(),
                )
            }
        }
    }
}

/// Which shape of result a read produces. Part of the result key, so the
/// same statement read as a row list and as a single row never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    Multi,
    Single,
}

impl ResultShape {
    fn as_str(self) -> &'static str {
        match self {
            ResultShape::Multi => "multi",
            ResultShape::Single => "single",
        }
    }
}

/// Everything about a read that distinguishes its result from other reads
/// over the same tables.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFingerprint {
    /// Statement text or any other stable shape identifier
    pub text: String,
    pub params: Vec<KeyPart>,
    pub ordering: Vec<String>,
    pub shape: ResultShape,
}

impl QueryFingerprint {
    pub fn new(text: impl Into<String>, shape: ResultShape) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
            ordering: Vec::new(),
            shape,
        }
    }

    pub fn with_params<I, P>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<KeyPart>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_ordering<I, S>(mut self, ordering: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ordering = ordering.into_iter().map(Into::into).collect();
        self
    }
}

/// Builds cache keys. Pure apart from [`KeyGenerator::fresh_token`].
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    config: CacheConfig,
}

impl KeyGenerator {
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    /// Hash a sequence of values into a 32 character hex fragment.
    pub fn gen_key(&self, values: &[KeyPart]) -> String {
        let mut hasher = Sha256::new();
        for value in values {
            value.write_canonical(&mut hasher);
        }
        hex::encode(&hasher.finalize()[..DIGEST_BYTES])
    }

    /// A new random generation token.
    pub fn fresh_token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    /// Key holding the generation token of one table.
    pub fn table_key(&self, table: &str, db: &str) -> String {
        format!(
            "{}_{}_table_{}",
            self.config.key_prefix,
            self.namespace(db),
            self.bounded(table)
        )
    }

    /// Key holding the token for a combination of tables.
    ///
    /// `tokens` must already be in canonical order; this does not sort.
    pub fn multi_key(&self, tokens: &[String], db: &str) -> String {
        let parts: Vec<KeyPart> = tokens.iter().map(|t| KeyPart::from(t.as_str())).collect();
        format!(
            "{}_{}_multi_{}",
            self.config.key_prefix,
            self.namespace(db),
            self.gen_key(&parts)
        )
    }

    /// Key under which the result of `query` at `generation` is cached.
    pub fn result_key(&self, generation: &str, query: &QueryFingerprint, db: &str) -> String {
        // sequences flatten when hashed; the lengths keep params and ordering apart
        let suffix = self.gen_key(&[
            KeyPart::from(query.text.as_str()),
            KeyPart::from(query.params.len()),
            KeyPart::Seq(query.params.clone()),
            KeyPart::from(query.ordering.len()),
            KeyPart::from(query.ordering.clone()),
            KeyPart::from(query.shape.as_str()),
        ]);
        format!(
            "{}_{}_query_{}.{}",
            self.config.key_prefix,
            self.namespace(db),
            generation,
            suffix
        )
    }

    fn namespace(&self, db: &str) -> String {
        self.bounded(self.config.cache_key_for(db))
    }

    fn bounded(&self, component: &str) -> String {
        if component.chars().count() <= MAX_COMPONENT_LEN {
            return component.to_owned();
        }
        let split = component
            .char_indices()
            .nth(TRUNCATED_HEAD_LEN)
            .map_or(component.len(), |(i, _)| i);
        let (head, rest) = component.split_at(split);
        format!("{}{}", head, self.gen_key(&[KeyPart::from(rest)]))
    }
}
