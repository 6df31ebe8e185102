use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// The subset of an OpenAPI 3.x document the catalog builder consumes.
///
/// Parsed leniently: unknown fields are ignored, missing ones default.
/// External `$ref`s are never fetched; internal `#/components/schemas/...`
/// references are resolved one level against the components table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub openapi: String,
    #[serde(default)]
    pub info: Info,
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
    #[serde(default)]
    pub components: Components,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathItem {
    pub get: Option<Operation>,
    pub put: Option<Operation>,
    pub post: Option<Operation>,
    pub delete: Option<Operation>,
    pub patch: Option<Operation>,
    pub head: Option<Operation>,
    pub options: Option<Operation>,
}

impl PathItem {
    /// Operations in a fixed method order so catalog builds are deterministic.
    pub fn operations(&self) -> impl Iterator<Item = (&'static str, &Operation)> {
        [
            ("GET", &self.get),
            ("PUT", &self.put),
            ("POST", &self.post),
            ("DELETE", &self.delete),
            ("PATCH", &self.patch),
            ("HEAD", &self.head),
            ("OPTIONS", &self.options),
        ]
        .into_iter()
        .filter_map(|(method, op)| op.as_ref().map(|op| (method, op)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(rename = "operationId", default)]
    pub operation_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(rename = "requestBody")]
    pub request_body: Option<RequestBody>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Parameter {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "in", default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    pub schema: Option<Schema>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub required: bool,
    /// Media type -> schema; BTreeMap keeps "first media type" deterministic.
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

impl RequestBody {
    pub fn first_schema(&self) -> Option<&Schema> {
        self.content.values().find_map(|media| media.schema.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaType {
    pub schema: Option<Schema>,
}

/// A JSON schema node, carried over verbatim into tool parameter schemas.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Schema {
    #[serde(rename = "$ref")]
    pub reference: Option<String>,
    /// A string, or an array of strings in 3.1 documents.
    #[serde(rename = "type")]
    pub kind: Option<Value>,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "enum", default)]
    pub variants: Vec<Value>,
    #[serde(default)]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default)]
    pub required: Vec<String>,
    pub items: Option<Box<Schema>>,
}

impl Schema {
    /// Primitive type name for endpoint records; multi-type schemas and bare
    /// references collapse to "string".
    pub fn type_name(&self) -> String {
        match &self.kind {
            Some(Value::String(s)) => s.clone(),
            _ => "string".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Components {
    #[serde(rename = "securitySchemes", default)]
    pub security_schemes: BTreeMap<String, SecurityScheme>,
    #[serde(default)]
    pub schemas: BTreeMap<String, Schema>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityScheme {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "in", default)]
    pub location: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub scheme: String,
}

impl Document {
    /// Follows a local `$ref` into `components.schemas`, one level deep.
    pub fn resolve<'a>(&'a self, schema: &'a Schema) -> &'a Schema {
        if let Some(reference) = &schema.reference {
            if let Some(name) = reference.strip_prefix("#/components/schemas/") {
                if let Some(resolved) = self.components.schemas.get(name) {
                    return resolved;
                }
            }
        }
        schema
    }

    /// Maps a schema node to the JSON value embedded in tool parameters.
    pub fn schema_to_value(&self, schema: &Schema) -> Value {
        let schema = self.resolve(schema);
        let mut out = Map::new();
        if let Some(kind) = &schema.kind {
            out.insert("type".to_string(), kind.clone());
        }
        if !schema.description.is_empty() {
            out.insert(
                "description".to_string(),
                Value::String(schema.description.clone()),
            );
        }
        if !schema.variants.is_empty() {
            out.insert("enum".to_string(), Value::Array(schema.variants.clone()));
        }
        if !schema.properties.is_empty() {
            let props: Map<String, Value> = schema
                .properties
                .iter()
                .map(|(name, prop)| (name.clone(), self.schema_to_value(prop)))
                .collect();
            out.insert("properties".to_string(), Value::Object(props));
        }
        if !schema.required.is_empty() {
            out.insert(
                "required".to_string(),
                Value::Array(
                    schema
                        .required
                        .iter()
                        .map(|r| Value::String(r.clone()))
                        .collect(),
                ),
            );
        }
        if let Some(items) = &schema.items {
            out.insert("items".to_string(), self.schema_to_value(items));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_component_references() {
        let json = serde_json::json!({
            "openapi": "3.0.0",
            "paths": {},
            "components": {
                "schemas": {
                    "Pet": {
                        "type": "object",
                        "properties": {"name": {"type": "string"}},
                        "required": ["name"]
                    }
                }
            }
        });
        let doc: Document = serde_json::from_value(json).expect("parse");
        let reference = Schema {
            reference: Some("#/components/schemas/Pet".to_string()),
            ..Default::default()
        };
        let value = doc.schema_to_value(&reference);
        assert_eq!(value["type"], "object");
        assert_eq!(value["required"][0], "name");
    }

    #[test]
    fn operations_iterate_in_method_order() {
        let item = PathItem {
            post: Some(Operation::default()),
            get: Some(Operation::default()),
            ..Default::default()
        };
        let methods: Vec<&str> = item.operations().map(|(m, _)| m).collect();
        assert_eq!(methods, vec!["GET", "POST"]);
    }
}
