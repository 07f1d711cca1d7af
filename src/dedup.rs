//! Suppression of immediate retransmissions.
//!
//! AcuRite sensors send every reading several times in a row. Only a payload that is
//! byte-identical to the one right before it is dropped; a repeat of an older payload
//! with a different message in between passes.

#[derive(Debug, Default)]
pub struct DeduplicationFilter {
    previous: Option<Vec<u8>>,
}

impl DeduplicationFilter {
    pub fn new() -> Self {
        DeduplicationFilter { previous: None }
    }

    /// Returns `true` if `payload` equals the previous payload.
    ///
    /// The payload becomes the new previous payload either way.
    pub fn is_duplicate(&mut self, payload: &[u8]) -> bool {
        let duplicate = self.previous.as_deref() == Some(payload);
        if !duplicate {
            self.previous = Some(payload.to_vec());
        }
        duplicate
    }
}
