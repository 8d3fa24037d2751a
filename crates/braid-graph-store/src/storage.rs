use serde_json::{Value, json};

/// Prefix marking a value as an internal storage back-reference.
pub const STORAGE_MARKER: &str = "$$";

/// Maps internal storage references to public location descriptors.
pub trait StorageResolver: Send + Sync {
  /// Descriptor for `key` (the marker already stripped), or `None` to keep
  /// the reference as is.
  fn resolve(&self, key: &str) -> Option<Value>;
}

/// Leaves every reference untouched.
#[derive(Debug, Clone, Default)]
pub struct NoopStorageResolver;

impl StorageResolver for NoopStorageResolver {
  fn resolve(&self, _key: &str) -> Option<Value> {
    None
  }
}

/// Resolves `$$key` to `{ "path": "<bucket>/<key>" }`.
#[derive(Debug, Clone)]
pub struct BucketStorageResolver {
  bucket: String,
}

impl BucketStorageResolver {
  pub fn new(bucket: impl Into<String>) -> Self {
    Self {
      bucket: bucket.into(),
    }
  }
}

impl StorageResolver for BucketStorageResolver {
  fn resolve(&self, key: &str) -> Option<Value> {
    Some(json!({ "path": format!("{}/{}", self.bucket, key) }))
  }
}

/// Replace every storage marker inside `value` with its descriptor.
pub(crate) fn substitute(value: &mut Value, resolver: &dyn StorageResolver) {
  match value {
    Value::String(s) => {
      if let Some(key) = s.strip_prefix(STORAGE_MARKER)
        && let Some(descriptor) = resolver.resolve(key)
      {
        *value = descriptor;
      }
    }
    Value::Array(items) => items.iter_mut().for_each(|v| substitute(v, resolver)),
    Value::Object(map) => map.values_mut().for_each(|v| substitute(v, resolver)),
    _ => {}
  }
}
