/// Panics with an internal-assertion message when `condition` is false.
///
/// Reserved for programming errors (broken invariants between components);
/// recoverable failures are returned as [`crate::error::FirestoreError`].
#[track_caller]
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

#[track_caller]
pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!("FIRESTORE INTERNAL ASSERTION FAILED: {}", message.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "FIRESTORE INTERNAL ASSERTION FAILED: queue out of order")]
    fn panics_on_false() {
        hard_assert(false, "queue out of order");
    }

    #[test]
    fn passes_on_true() {
        hard_assert(true, "never shown");
        assert!(assertion_error("boom").ends_with("boom"));
    }
}
