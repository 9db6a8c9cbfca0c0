//! Conversion between [`PropertyValue`] and the `google.protobuf.Struct`
//! representation providers receive over the plugin wire.
//!
//! Secrets, unknowns, outputs, assets, archives, and resource references are
//! encoded as tagged structs using the standard signature keys; wrapper
//! identity always survives a round trip.

use std::collections::BTreeMap;

use crate::property::{
    Archive, Asset, OutputValue, PropertyMap, PropertyValue, ResourceReference, ARCHIVE_SIG,
    ASSET_SIG, OUTPUT_SIG, RESOURCE_SIG, SECRET_SIG, SIG_KEY, UNKNOWN_VALUE,
};
use crate::urn::Urn;

fn string_value(s: impl Into<String>) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::StringValue(s.into())),
    }
}

fn bool_value(b: bool) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::BoolValue(b)),
    }
}

fn struct_value(fields: BTreeMap<String, prost_types::Value>) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::StructValue(prost_types::Struct {
            fields,
        })),
    }
}

/// Converts a property map into a `Struct` for transmission to a provider.
pub fn map_to_struct(map: &PropertyMap) -> prost_types::Struct {
    prost_types::Struct {
        fields: map
            .iter()
            .map(|(k, v)| (k.clone(), value_to_protobuf(v)))
            .collect(),
    }
}

/// Converts a provider-returned `Struct` back into a property map.
pub fn struct_to_map(s: &prost_types::Struct) -> PropertyMap {
    s.fields
        .iter()
        .map(|(k, v)| (k.clone(), protobuf_to_value(v)))
        .collect()
}

/// Converts a single `PropertyValue` into a `prost_types::Value`.
pub fn value_to_protobuf(val: &PropertyValue) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match val {
        PropertyValue::Null => Kind::NullValue(0),
        PropertyValue::Bool(b) => Kind::BoolValue(*b),
        PropertyValue::Number(n) => Kind::NumberValue(*n),
        PropertyValue::String(s) => Kind::StringValue(s.clone()),
        PropertyValue::Array(items) => {
            let values: Vec<prost_types::Value> = items.iter().map(value_to_protobuf).collect();
            Kind::ListValue(prost_types::ListValue { values })
        }
        PropertyValue::Object(entries) => {
            let fields: BTreeMap<String, prost_types::Value> = entries
                .iter()
                .map(|(k, v)| (k.clone(), value_to_protobuf(v)))
                .collect();
            Kind::StructValue(prost_types::Struct { fields })
        }
        PropertyValue::Secret(inner) => {
            let mut fields = BTreeMap::new();
            fields.insert(SIG_KEY.to_string(), string_value(SECRET_SIG));
            fields.insert("value".to_string(), value_to_protobuf(inner));
            return struct_value(fields);
        }
        PropertyValue::Computed => Kind::StringValue(UNKNOWN_VALUE.to_string()),
        PropertyValue::Output(o) => {
            let mut fields = BTreeMap::new();
            fields.insert(SIG_KEY.to_string(), string_value(OUTPUT_SIG));
            if let Some(element) = &o.element {
                fields.insert("value".to_string(), value_to_protobuf(element));
            }
            fields.insert("known".to_string(), bool_value(o.known));
            fields.insert("secret".to_string(), bool_value(o.secret));
            let deps: Vec<prost_types::Value> = o
                .dependencies
                .iter()
                .map(|u| string_value(u.as_str()))
                .collect();
            fields.insert(
                "dependencies".to_string(),
                prost_types::Value {
                    kind: Some(Kind::ListValue(prost_types::ListValue { values: deps })),
                },
            );
            return struct_value(fields);
        }
        PropertyValue::ResourceReference(r) => {
            let mut fields = BTreeMap::new();
            fields.insert(SIG_KEY.to_string(), string_value(RESOURCE_SIG));
            fields.insert("urn".to_string(), string_value(r.urn.as_str()));
            if let Some(id) = &r.id {
                fields.insert("id".to_string(), string_value(id));
            }
            fields.insert(
                "packageVersion".to_string(),
                string_value(&r.package_version),
            );
            return struct_value(fields);
        }
        PropertyValue::Asset(asset) => {
            let mut fields = BTreeMap::new();
            fields.insert(SIG_KEY.to_string(), string_value(ASSET_SIG));
            match asset {
                Asset::Text(s) => {
                    fields.insert("text".to_string(), string_value(s));
                }
                Asset::File(p) => {
                    fields.insert("path".to_string(), string_value(p));
                }
                Asset::Remote(u) => {
                    fields.insert("uri".to_string(), string_value(u));
                }
            }
            return struct_value(fields);
        }
        PropertyValue::Archive(archive) => {
            let mut fields = BTreeMap::new();
            fields.insert(SIG_KEY.to_string(), string_value(ARCHIVE_SIG));
            match archive {
                Archive::File(p) => {
                    fields.insert("path".to_string(), string_value(p));
                }
                Archive::Remote(u) => {
                    fields.insert("uri".to_string(), string_value(u));
                }
                Archive::Assets(entries) => {
                    let assets: BTreeMap<String, prost_types::Value> = entries
                        .iter()
                        .map(|(k, v)| (k.clone(), value_to_protobuf(v)))
                        .collect();
                    fields.insert("assets".to_string(), struct_value(assets));
                }
            }
            return struct_value(fields);
        }
    };

    prost_types::Value { kind: Some(kind) }
}

fn get_str(obj: &prost_types::Struct, key: &str) -> Option<String> {
    match obj.fields.get(key).and_then(|v| v.kind.as_ref()) {
        Some(prost_types::value::Kind::StringValue(s)) => Some(s.clone()),
        _ => None,
    }
}

fn get_bool(obj: &prost_types::Struct, key: &str) -> Option<bool> {
    match obj.fields.get(key).and_then(|v| v.kind.as_ref()) {
        Some(prost_types::value::Kind::BoolValue(b)) => Some(*b),
        _ => None,
    }
}

/// Converts a `prost_types::Value` back into a `PropertyValue`.
pub fn protobuf_to_value(pv: &prost_types::Value) -> PropertyValue {
    use prost_types::value::Kind;

    let kind = match &pv.kind {
        Some(k) => k,
        None => return PropertyValue::Null,
    };

    match kind {
        Kind::NullValue(_) => PropertyValue::Null,
        Kind::BoolValue(b) => PropertyValue::Bool(*b),
        Kind::NumberValue(n) => PropertyValue::Number(*n),
        Kind::StringValue(s) => {
            if s == UNKNOWN_VALUE {
                PropertyValue::Computed
            } else {
                PropertyValue::String(s.clone())
            }
        }
        Kind::ListValue(list) => {
            PropertyValue::Array(list.values.iter().map(protobuf_to_value).collect())
        }
        Kind::StructValue(obj) => {
            if let Some(sig) = get_str(obj, SIG_KEY) {
                match sig.as_str() {
                    SECRET_SIG => {
                        let inner = obj
                            .fields
                            .get("value")
                            .map(protobuf_to_value)
                            .unwrap_or(PropertyValue::Null);
                        return PropertyValue::secret(inner);
                    }
                    OUTPUT_SIG => {
                        let element = obj.fields.get("value").map(protobuf_to_value);
                        let known = get_bool(obj, "known").unwrap_or(element.is_some());
                        let secret = get_bool(obj, "secret").unwrap_or(false);
                        let dependencies = match obj.fields.get("dependencies").and_then(|v| v.kind.as_ref()) {
                            Some(Kind::ListValue(list)) => list
                                .values
                                .iter()
                                .filter_map(|v| match v.kind.as_ref() {
                                    Some(Kind::StringValue(s)) => Urn::parse(s).ok(),
                                    _ => None,
                                })
                                .collect(),
                            _ => Vec::new(),
                        };
                        return PropertyValue::Output(Box::new(OutputValue {
                            element,
                            known,
                            secret,
                            dependencies,
                        }));
                    }
                    RESOURCE_SIG => {
                        if let Some(urn) = get_str(obj, "urn").and_then(|u| Urn::parse(&u).ok()) {
                            return PropertyValue::ResourceReference(ResourceReference {
                                urn,
                                id: get_str(obj, "id"),
                                package_version: get_str(obj, "packageVersion")
                                    .unwrap_or_default(),
                            });
                        }
                    }
                    ASSET_SIG => {
                        if let Some(text) = get_str(obj, "text") {
                            return PropertyValue::Asset(Asset::Text(text));
                        }
                        if let Some(path) = get_str(obj, "path") {
                            return PropertyValue::Asset(Asset::File(path));
                        }
                        if let Some(uri) = get_str(obj, "uri") {
                            return PropertyValue::Asset(Asset::Remote(uri));
                        }
                    }
                    ARCHIVE_SIG => {
                        if let Some(path) = get_str(obj, "path") {
                            return PropertyValue::Archive(Archive::File(path));
                        }
                        if let Some(uri) = get_str(obj, "uri") {
                            return PropertyValue::Archive(Archive::Remote(uri));
                        }
                        if let Some(Kind::StructValue(assets)) =
                            obj.fields.get("assets").and_then(|v| v.kind.as_ref())
                        {
                            let entries = assets
                                .fields
                                .iter()
                                .map(|(k, v)| (k.clone(), protobuf_to_value(v)))
                                .collect();
                            return PropertyValue::Archive(Archive::Assets(entries));
                        }
                    }
                    _ => {}
                }
            }

            // Regular object.
            PropertyValue::Object(
                obj.fields
                    .iter()
                    .map(|(k, v)| (k.clone(), protobuf_to_value(v)))
                    .collect(),
            )
        }
    }
}
