use crate::error::{StorageError, StorageResult};

/// What a verify pass does when it finds an inconsistency.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyTreatment {
    /// Record the finding and keep walking.
    Continue,
    /// Stop at the first finding and raise `Corrupted`.
    Abort,
}

/// Accumulator for one verify pass.
#[derive(Default)]
pub struct Progress {
    pages_verified: u32,
    inconsistencies: Vec<String>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_page(&mut self) {
        self.pages_verified += 1;
    }

    pub fn report(&mut self, finding: impl Into<String>) {
        self.inconsistencies.push(finding.into());
    }

    pub fn get_pages_verified(&self) -> u32 {
        self.pages_verified
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistencies.is_empty()
    }

    pub fn get_inconsistencies(&self) -> &[String] {
        &self.inconsistencies
    }

    /// Apply the treatment: under `Abort` the first finding becomes an
    /// error.
    pub fn finish(&self, treatment: VerifyTreatment) -> StorageResult<()> {
        if treatment == VerifyTreatment::Abort && !self.is_consistent() {
            return Err(StorageError::Corrupted(
                self.inconsistencies[0].clone(),
            ));
        }
        Ok(())
    }
}
