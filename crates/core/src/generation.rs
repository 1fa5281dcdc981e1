//! Generation bookkeeping for detecting stale status.

use kube::api::ObjectMeta;
use kube::core::DynamicObject;
use serde_json::Value as Json;

use crate::{Error, Result};

/// True when `observed_generation` matches the object's current generation.
pub fn is_status_current(meta: &ObjectMeta, observed_generation: Option<i64>) -> bool {
    meta.generation == observed_generation
}

/// `status.observedGeneration` of an untyped object, if present.
pub fn observed_generation(obj: &DynamicObject) -> Result<Option<i64>> {
    match obj.data.get("status").and_then(|s| s.get("observedGeneration")) {
        None | Some(Json::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| Error::invalid_field("status.observedGeneration", format!("not an integer: {}", v))),
    }
}

/// Set `dest.status.observedGeneration = dest.generation`, but only when `src` reports a current
/// status itself. Returns whether `dest` was changed.
///
/// Used when a controller mirrors the status of one object onto another: the mirror may only
/// claim to have observed its own spec once the source has observed its spec.
pub fn update_observed_generation(src: &DynamicObject, dest: &mut DynamicObject) -> Result<bool> {
    let Some(src_observed) = observed_generation(src)? else {
        return Ok(false);
    };
    if Some(src_observed) != src.metadata.generation {
        return Ok(false);
    }
    let generation = dest.metadata.generation.unwrap_or_default();
    if observed_generation(dest)? == Some(generation) {
        return Ok(false);
    }
    if !dest.data.is_object() {
        dest.data = Json::Object(Default::default());
    }
    let status = dest
        .data
        .as_object_mut()
        .map(|o| o.entry("status").or_insert_with(|| Json::Object(Default::default())));
    match status {
        Some(Json::Object(status)) => {
            status.insert("observedGeneration".into(), Json::from(generation));
            Ok(true)
        }
        _ => Err(Error::invalid_field("status", "not an object")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn obj(generation: i64, status: Json) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("catalog.steward.io", "v1alpha1", "Offering"));
        let mut o = DynamicObject::new("x", &ar).within("ns").data(json!({ "status": status }));
        o.metadata.generation = Some(generation);
        o
    }

    #[test]
    fn current_source_propagates_generation() {
        let src = obj(4, json!({ "observedGeneration": 4 }));
        let mut dest = obj(7, json!({}));
        assert!(update_observed_generation(&src, &mut dest).unwrap());
        assert_eq!(observed_generation(&dest).unwrap(), Some(7));
        assert!(!update_observed_generation(&src, &mut dest).unwrap(), "second call is a no-op");
    }

    #[test]
    fn stale_or_missing_source_status_is_ignored() {
        let stale = obj(4, json!({ "observedGeneration": 3 }));
        let mut dest = obj(7, json!({ "observedGeneration": 6 }));
        assert!(!update_observed_generation(&stale, &mut dest).unwrap());
        assert_eq!(observed_generation(&dest).unwrap(), Some(6));

        let missing = obj(4, json!({}));
        assert!(!update_observed_generation(&missing, &mut dest).unwrap());
    }

    #[test]
    fn malformed_generation_is_an_error() {
        let bad = obj(1, json!({ "observedGeneration": "one" }));
        assert!(observed_generation(&bad).is_err());
    }

    #[test]
    fn status_currency_compares_generations() {
        let meta = ObjectMeta { generation: Some(2), ..Default::default() };
        assert!(is_status_current(&meta, Some(2)));
        assert!(!is_status_current(&meta, Some(1)));
        assert!(!is_status_current(&meta, None));
    }
}
