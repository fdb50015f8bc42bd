//! Correlation id generation.

use uuid::Uuid;

/// Source of globally unique correlation ids.
///
/// The controller holds this as `Arc<dyn IdGenerator>`; tests swap in a
/// deterministic generator.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator: random UUID v4 in simple (hyphen-free) form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

// Compile-time assertion: IdGenerator must be usable as `dyn IdGenerator`.
const _: () = {
    fn _assert_object_safe(_: &dyn IdGenerator) {}
};
