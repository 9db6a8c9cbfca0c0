use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::urn::Urn;

/// The signature key marking a tagged wrapper object in the serialized form.
pub const SIG_KEY: &str = "4dabf18193072939515e22adb298388d";
/// Signature of a secret wrapper.
pub const SECRET_SIG: &str = "1b47061264138c4ac30d75fd1eb44270";
/// Signature of a resource reference.
pub const RESOURCE_SIG: &str = "5cf8f73096256a8f31e491e813e4eb8e";
/// Signature of an output wrapper.
pub const OUTPUT_SIG: &str = "d0e6a833031e9bbcd3f4e8bde6ca49a4";
/// Signature of an asset.
pub const ASSET_SIG: &str = "c44067f5952c0a294b673a41bacd8c17";
/// Signature of an archive.
pub const ARCHIVE_SIG: &str = "0def7320c3a5731c473e5ecbe6d01bc7";
/// Sentinel string for a value that is unknown during preview.
pub const UNKNOWN_VALUE: &str = "04da6b54-80e4-46f7-96ec-b56ff0331ba9";

/// A keyed property map. `BTreeMap` keeps snapshot and wire encodings
/// deterministic.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// A property value attached to resource inputs, outputs, or hook payloads.
///
/// This is the only representation of resource property data in the engine.
/// `Secret` and known `Output` wrappers are transparent for equality.
#[derive(Clone)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<PropertyValue>),
    Object(PropertyMap),
    Asset(Asset),
    Archive(Archive),
    Secret(Box<PropertyValue>),
    /// A value unknown during preview.
    Computed,
    /// A full output wrapper carrying knownness, secretness, and dependencies.
    Output(Box<OutputValue>),
    /// A reference to another resource managed by some provider.
    ResourceReference(ResourceReference),
}

/// The payload of a `PropertyValue::Output`.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputValue {
    pub element: Option<PropertyValue>,
    pub known: bool,
    pub secret: bool,
    pub dependencies: Vec<Urn>,
}

/// A strongly typed reference to another resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceReference {
    pub urn: Urn,
    pub id: Option<String>,
    pub package_version: String,
}

/// An asset value.
#[derive(Debug, Clone, PartialEq)]
pub enum Asset {
    Text(String),
    File(String),
    Remote(String),
}

/// An archive value.
#[derive(Debug, Clone, PartialEq)]
pub enum Archive {
    File(String),
    Remote(String),
    Assets(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Wraps a value in a secret.
    pub fn secret(inner: PropertyValue) -> Self {
        PropertyValue::Secret(Box::new(inner))
    }

    /// A convenience string constructor.
    pub fn string(s: impl Into<String>) -> Self {
        PropertyValue::String(s.into())
    }

    /// Returns true if this is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Returns true if this is a secret wrapper.
    pub fn is_secret(&self) -> bool {
        matches!(self, PropertyValue::Secret(_))
    }

    /// Returns true if this value is unknown at the top level: `Computed` or
    /// an unknown `Output`.
    pub fn is_computed(&self) -> bool {
        match self {
            PropertyValue::Computed => true,
            PropertyValue::Output(o) => !o.known,
            PropertyValue::Secret(inner) => inner.is_computed(),
            _ => false,
        }
    }

    /// Returns true if any nested value is unknown.
    pub fn contains_unknowns(&self) -> bool {
        match self {
            PropertyValue::Computed => true,
            PropertyValue::Output(o) => !o.known || o.element.as_ref().is_some_and(|e| e.contains_unknowns()),
            PropertyValue::Secret(inner) => inner.contains_unknowns(),
            PropertyValue::Array(items) => items.iter().any(|v| v.contains_unknowns()),
            PropertyValue::Object(entries) => entries.values().any(|v| v.contains_unknowns()),
            _ => false,
        }
    }

    /// Returns true if any nested value is secret.
    pub fn contains_secrets(&self) -> bool {
        match self {
            PropertyValue::Secret(_) => true,
            PropertyValue::Output(o) => o.secret || o.element.as_ref().is_some_and(|e| e.contains_secrets()),
            PropertyValue::Array(items) => items.iter().any(|v| v.contains_secrets()),
            PropertyValue::Object(entries) => entries.values().any(|v| v.contains_secrets()),
            _ => false,
        }
    }

    /// Tries to get the value as a string slice, looking through wrappers.
    pub fn as_str(&self) -> Option<&str> {
        match self.unwrap() {
            PropertyValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Tries to get the value as a bool, looking through wrappers.
    pub fn as_bool(&self) -> Option<bool> {
        match self.unwrap() {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Tries to get the value as a number, looking through wrappers.
    pub fn as_number(&self) -> Option<f64> {
        match self.unwrap() {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Tries to get the value as an object, looking through wrappers.
    pub fn as_object(&self) -> Option<&PropertyMap> {
        match self.unwrap() {
            PropertyValue::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Peels `Secret` and known `Output` wrappers, returning the innermost
    /// plain value. Unknown outputs are left in place.
    pub fn unwrap(&self) -> &PropertyValue {
        match self {
            PropertyValue::Secret(inner) => inner.unwrap(),
            PropertyValue::Output(o) if o.known => match &o.element {
                Some(element) => element.unwrap(),
                None => self,
            },
            other => other,
        }
    }

    /// Returns a type name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Null => "null",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::Number(_) => "number",
            PropertyValue::String(_) => "string",
            PropertyValue::Array(_) => "array",
            PropertyValue::Object(_) => "object",
            PropertyValue::Asset(_) => "asset",
            PropertyValue::Archive(_) => "archive",
            PropertyValue::Secret(_) => "secret",
            PropertyValue::Computed => "computed",
            PropertyValue::Output(_) => "output",
            PropertyValue::ResourceReference(_) => "resource-reference",
        }
    }
}

/// Structural equality, transparent across `Secret` and known `Output`
/// wrappers. Unknown values compare equal to each other regardless of the
/// wrapper carrying them.
impl PartialEq for PropertyValue {
    fn eq(&self, other: &Self) -> bool {
        let a = self.unwrap();
        let b = other.unwrap();
        match (a, b) {
            (PropertyValue::Null, PropertyValue::Null) => true,
            (PropertyValue::Bool(x), PropertyValue::Bool(y)) => x == y,
            (PropertyValue::Number(x), PropertyValue::Number(y)) => x == y,
            (PropertyValue::String(x), PropertyValue::String(y)) => x == y,
            (PropertyValue::Array(x), PropertyValue::Array(y)) => x == y,
            (PropertyValue::Object(x), PropertyValue::Object(y)) => x == y,
            (PropertyValue::Asset(x), PropertyValue::Asset(y)) => x == y,
            (PropertyValue::Archive(x), PropertyValue::Archive(y)) => x == y,
            (PropertyValue::ResourceReference(x), PropertyValue::ResourceReference(y)) => x == y,
            (PropertyValue::Computed, PropertyValue::Computed) => true,
            (PropertyValue::Computed, PropertyValue::Output(o))
            | (PropertyValue::Output(o), PropertyValue::Computed) => !o.known,
            (PropertyValue::Output(x), PropertyValue::Output(y)) => !x.known && !y.known,
            _ => false,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "Null"),
            PropertyValue::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            PropertyValue::Number(n) => f.debug_tuple("Number").field(n).finish(),
            PropertyValue::String(s) => f.debug_tuple("String").field(s).finish(),
            PropertyValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            PropertyValue::Object(entries) => f.debug_tuple("Object").field(entries).finish(),
            PropertyValue::Asset(a) => f.debug_tuple("Asset").field(a).finish(),
            PropertyValue::Archive(a) => f.debug_tuple("Archive").field(a).finish(),
            PropertyValue::Secret(_) => write!(f, "Secret([REDACTED])"),
            PropertyValue::Computed => write!(f, "Computed"),
            PropertyValue::Output(o) if o.secret => write!(f, "Output([REDACTED])"),
            PropertyValue::Output(o) => f.debug_tuple("Output").field(o).finish(),
            PropertyValue::ResourceReference(r) => {
                f.debug_tuple("ResourceReference").field(r).finish()
            }
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Null => write!(f, "null"),
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Number(n) => write!(f, "{}", n),
            PropertyValue::String(s) => write!(f, "{}", s),
            PropertyValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            PropertyValue::Object(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            PropertyValue::Asset(_) => write!(f, "[asset]"),
            PropertyValue::Archive(_) => write!(f, "[archive]"),
            PropertyValue::Secret(_) => write!(f, "[secret]"),
            PropertyValue::Computed => write!(f, "[unknown]"),
            PropertyValue::Output(o) if o.secret || !o.known => write!(f, "[output]"),
            PropertyValue::Output(o) => match &o.element {
                Some(element) => write!(f, "{}", element),
                None => write!(f, "[output]"),
            },
            PropertyValue::ResourceReference(r) => write!(f, "resource({})", r.urn),
        }
    }
}

impl PropertyValue {
    /// Converts this value to the tagged JSON encoding used by snapshot
    /// files. Wrapper identity is preserved; asset text is base64-encoded so
    /// the file stays ASCII-safe.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Bool(b) => json!(b),
            PropertyValue::Number(n) => json!(n),
            PropertyValue::String(s) => json!(s),
            PropertyValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json()).collect())
            }
            PropertyValue::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            PropertyValue::Asset(asset) => match asset {
                Asset::Text(s) => json!({
                    SIG_KEY: ASSET_SIG,
                    "text": BASE64.encode(s.as_bytes()),
                }),
                Asset::File(p) => json!({ SIG_KEY: ASSET_SIG, "path": p }),
                Asset::Remote(u) => json!({ SIG_KEY: ASSET_SIG, "uri": u }),
            },
            PropertyValue::Archive(archive) => match archive {
                Archive::File(p) => json!({ SIG_KEY: ARCHIVE_SIG, "path": p }),
                Archive::Remote(u) => json!({ SIG_KEY: ARCHIVE_SIG, "uri": u }),
                Archive::Assets(entries) => json!({
                    SIG_KEY: ARCHIVE_SIG,
                    "assets": serde_json::Value::Object(
                        entries.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                    ),
                }),
            },
            PropertyValue::Secret(inner) => json!({
                SIG_KEY: SECRET_SIG,
                "value": inner.to_json(),
            }),
            PropertyValue::Computed => json!(UNKNOWN_VALUE),
            PropertyValue::Output(o) => {
                let mut obj = serde_json::Map::new();
                obj.insert(SIG_KEY.to_string(), json!(OUTPUT_SIG));
                if let Some(element) = &o.element {
                    obj.insert("value".to_string(), element.to_json());
                }
                obj.insert("known".to_string(), json!(o.known));
                obj.insert("secret".to_string(), json!(o.secret));
                obj.insert(
                    "dependencies".to_string(),
                    serde_json::Value::Array(
                        o.dependencies
                            .iter()
                            .map(|u| json!(u.as_str()))
                            .collect(),
                    ),
                );
                serde_json::Value::Object(obj)
            }
            PropertyValue::ResourceReference(r) => {
                let mut obj = serde_json::Map::new();
                obj.insert(SIG_KEY.to_string(), json!(RESOURCE_SIG));
                obj.insert("urn".to_string(), json!(r.urn.as_str()));
                if let Some(id) = &r.id {
                    obj.insert("id".to_string(), json!(id));
                }
                obj.insert("packageVersion".to_string(), json!(r.package_version));
                serde_json::Value::Object(obj)
            }
        }
    }

    /// Parses the tagged JSON encoding back into a value.
    pub fn from_json(v: &serde_json::Value) -> Result<PropertyValue, String> {
        match v {
            serde_json::Value::Null => Ok(PropertyValue::Null),
            serde_json::Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                Ok(PropertyValue::Number(n.as_f64().unwrap_or(0.0)))
            }
            serde_json::Value::String(s) if s == UNKNOWN_VALUE => Ok(PropertyValue::Computed),
            serde_json::Value::String(s) => Ok(PropertyValue::String(s.clone())),
            serde_json::Value::Array(items) => Ok(PropertyValue::Array(
                items
                    .iter()
                    .map(PropertyValue::from_json)
                    .collect::<Result<_, _>>()?,
            )),
            serde_json::Value::Object(obj) => {
                let sig = obj.get(SIG_KEY).and_then(|s| s.as_str());
                match sig {
                    Some(SECRET_SIG) => {
                        let inner = obj
                            .get("value")
                            .map(PropertyValue::from_json)
                            .transpose()?
                            .unwrap_or(PropertyValue::Null);
                        Ok(PropertyValue::secret(inner))
                    }
                    Some(ASSET_SIG) => {
                        if let Some(text) = obj.get("text").and_then(|t| t.as_str()) {
                            let bytes = BASE64
                                .decode(text)
                                .map_err(|e| format!("invalid asset text: {}", e))?;
                            let s = String::from_utf8(bytes)
                                .map_err(|e| format!("invalid asset text: {}", e))?;
                            Ok(PropertyValue::Asset(Asset::Text(s)))
                        } else if let Some(path) = obj.get("path").and_then(|p| p.as_str()) {
                            Ok(PropertyValue::Asset(Asset::File(path.to_string())))
                        } else if let Some(uri) = obj.get("uri").and_then(|u| u.as_str()) {
                            Ok(PropertyValue::Asset(Asset::Remote(uri.to_string())))
                        } else {
                            Err("asset object has no text, path, or uri".to_string())
                        }
                    }
                    Some(ARCHIVE_SIG) => {
                        if let Some(path) = obj.get("path").and_then(|p| p.as_str()) {
                            Ok(PropertyValue::Archive(Archive::File(path.to_string())))
                        } else if let Some(uri) = obj.get("uri").and_then(|u| u.as_str()) {
                            Ok(PropertyValue::Archive(Archive::Remote(uri.to_string())))
                        } else if let Some(serde_json::Value::Object(assets)) = obj.get("assets") {
                            let entries = assets
                                .iter()
                                .map(|(k, v)| Ok((k.clone(), PropertyValue::from_json(v)?)))
                                .collect::<Result<_, String>>()?;
                            Ok(PropertyValue::Archive(Archive::Assets(entries)))
                        } else {
                            Err("archive object has no path, uri, or assets".to_string())
                        }
                    }
                    Some(OUTPUT_SIG) => {
                        let element = obj
                            .get("value")
                            .map(PropertyValue::from_json)
                            .transpose()?;
                        let known = obj
                            .get("known")
                            .and_then(|k| k.as_bool())
                            .unwrap_or(element.is_some());
                        let secret = obj
                            .get("secret")
                            .and_then(|s| s.as_bool())
                            .unwrap_or(false);
                        let dependencies = match obj.get("dependencies") {
                            Some(serde_json::Value::Array(deps)) => deps
                                .iter()
                                .filter_map(|d| d.as_str())
                                .map(|d| Urn::parse(d).map_err(|e| e.to_string()))
                                .collect::<Result<_, _>>()?,
                            _ => Vec::new(),
                        };
                        Ok(PropertyValue::Output(Box::new(OutputValue {
                            element,
                            known,
                            secret,
                            dependencies,
                        })))
                    }
                    Some(RESOURCE_SIG) => {
                        let urn = obj
                            .get("urn")
                            .and_then(|u| u.as_str())
                            .ok_or_else(|| "resource reference has no urn".to_string())?;
                        Ok(PropertyValue::ResourceReference(ResourceReference {
                            urn: Urn::parse(urn).map_err(|e| e.to_string())?,
                            id: obj
                                .get("id")
                                .and_then(|i| i.as_str())
                                .map(|i| i.to_string()),
                            package_version: obj
                                .get("packageVersion")
                                .and_then(|p| p.as_str())
                                .unwrap_or("")
                                .to_string(),
                        }))
                    }
                    Some(other) => Err(format!("unrecognized signature {:?}", other)),
                    None => Ok(PropertyValue::Object(
                        obj.iter()
                            .map(|(k, v)| Ok((k.clone(), PropertyValue::from_json(v)?)))
                            .collect::<Result<_, String>>()?,
                    )),
                }
            }
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PropertyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = serde_json::Value::deserialize(deserializer)?;
        PropertyValue::from_json(&v).map_err(D::Error::custom)
    }
}
