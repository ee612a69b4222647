use anyhow::anyhow;
use std::any::Any;

/// Turn a `catch_unwind` payload into an error that can be recorded on the
/// job. Panic payloads are untyped; the string forms cover what `panic!`
/// commonly produces.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}
