//! Finalizer tokens: their presence blocks physical deletion until the owning controller
//! removes them.

use kube::api::ObjectMeta;

/// Add `finalizer` unless already present. Returns whether the metadata changed.
pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == finalizer) {
        return false;
    }
    finalizers.push(finalizer.to_string());
    true
}

/// Remove `finalizer` if present. Returns whether the metadata changed.
pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let Some(pos) = finalizers.iter().position(|f| f == finalizer) else {
        return false;
    };
    finalizers.remove(pos);
    if finalizers.is_empty() {
        meta.finalizers = None;
    }
    true
}

pub fn has_finalizer(meta: &ObjectMeta, finalizer: &str) -> bool {
    meta.finalizers.as_ref().map(|fs| fs.iter().any(|f| f == finalizer)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "steward.io/cleanup";

    #[test]
    fn add_is_idempotent() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, TOKEN));
        assert!(!add_finalizer(&mut meta, TOKEN));
        assert!(add_finalizer(&mut meta, "other.io/hold"));
        assert_eq!(meta.finalizers.as_deref(), Some(&[TOKEN.to_string(), "other.io/hold".to_string()][..]));
        assert!(has_finalizer(&meta, TOKEN));
    }

    #[test]
    fn remove_only_touches_the_given_token() {
        let mut meta = ObjectMeta { finalizers: Some(vec![TOKEN.into(), "other.io/hold".into()]), ..Default::default() };
        assert!(!remove_finalizer(&mut meta, "missing.io/x"));
        assert!(remove_finalizer(&mut meta, TOKEN));
        assert!(!has_finalizer(&meta, TOKEN));
        assert!(has_finalizer(&meta, "other.io/hold"));

        assert!(remove_finalizer(&mut meta, "other.io/hold"));
        assert!(meta.finalizers.is_none());
        assert!(!remove_finalizer(&mut meta, TOKEN));
    }
}
