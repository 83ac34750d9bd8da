//! Process-wide registry of running applications.
//!
//! At most one running application per [`AppName`] per process. This map
//! is the only piece of process-global mutable state in the library.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use shardflow_core::{AppName, StreamName};
use std::collections::HashMap;

static RUNNING_APPS: Lazy<Mutex<HashMap<AppName, StreamName>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Atomically register `app_name` as running against `stream`. Fails with
/// [`Error::AppNameAlreadyRunning`] when the name is taken.
pub(crate) fn register(app_name: &AppName, stream: &StreamName) -> Result<()> {
    let mut apps = RUNNING_APPS.lock();
    if apps.contains_key(app_name) {
        return Err(Error::AppNameAlreadyRunning(app_name.clone()));
    }
    apps.insert(app_name.clone(), stream.clone());
    Ok(())
}

/// Remove `app_name` from the registry. Idempotent.
pub(crate) fn deregister(app_name: &AppName) {
    RUNNING_APPS.lock().remove(app_name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let name = AppName::from("registry-test-duplicate");
        let stream = StreamName::from("events");
        register(&name, &stream).unwrap();
        let err = register(&name, &stream).unwrap_err();
        assert!(matches!(err, Error::AppNameAlreadyRunning(_)));
        deregister(&name);
        // free again after deregistration
        register(&name, &stream).unwrap();
        deregister(&name);
    }

    #[test]
    fn deregister_is_idempotent() {
        let name = AppName::from("registry-test-idempotent");
        deregister(&name);
        register(&name, &StreamName::from("s")).unwrap();
        deregister(&name);
        deregister(&name);
        // the name is usable again
        register(&name, &StreamName::from("s")).unwrap();
        deregister(&name);
    }
}
