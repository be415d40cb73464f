//! Relevance and minimal-information filter for extracted candidates.

use std::fmt;

use svcdir_core::CandidateRecord;
use tracing::debug;

const MIN_NAME_CHARS: usize = 3;
const MIN_DESCRIPTION_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingName,
    NameTooShort,
    NoLocality,
    NoSubstance,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Rejection::MissingName => "missing name",
            Rejection::NameTooShort => "name too short",
            Rejection::NoLocality => "no locality match",
            Rejection::NoSubstance => "no contact details or description",
        };
        f.write_str(text)
    }
}

/// Accepts a candidate only when it is both local (a locality token appears in
/// name, description or address) and substantive (phone, email or address, or a
/// description longer than 20 characters).
#[derive(Debug, Clone)]
pub struct RecordValidator {
    locality_tokens: Vec<String>,
}

impl RecordValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let locality_tokens = tokens
            .into_iter()
            .map(|token| token.as_ref().trim().to_lowercase())
            .filter(|token| !token.is_empty())
            .collect();
        Self { locality_tokens }
    }

    pub fn locality_tokens(&self) -> &[String] {
        &self.locality_tokens
    }

    pub fn is_valid(&self, candidate: &CandidateRecord) -> bool {
        match self.check(candidate) {
            Ok(()) => true,
            Err(rejection) => {
                debug!(
                    name = candidate.name.as_deref().unwrap_or(""),
                    %rejection,
                    "candidate rejected"
                );
                false
            }
        }
    }

    pub fn check(&self, candidate: &CandidateRecord) -> Result<(), Rejection> {
        let name = present(&candidate.name).ok_or(Rejection::MissingName)?;
        if name.chars().count() < MIN_NAME_CHARS {
            return Err(Rejection::NameTooShort);
        }

        let haystack = [
            Some(name),
            present(&candidate.description),
            present(&candidate.address),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
        if !self
            .locality_tokens
            .iter()
            .any(|token| haystack.contains(token.as_str()))
        {
            return Err(Rejection::NoLocality);
        }

        let has_contact = present(&candidate.phone).is_some()
            || present(&candidate.email).is_some()
            || present(&candidate.address).is_some();
        let has_description = present(&candidate.description)
            .is_some_and(|desc| desc.chars().count() > MIN_DESCRIPTION_CHARS);
        if !(has_contact || has_description) {
            return Err(Rejection::NoSubstance);
        }
        Ok(())
    }
}

fn present(field: &Option<String>) -> Option<&str> {
    field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> RecordValidator {
        RecordValidator::new(["Example Town", "00000"])
    }

    #[test]
    fn short_names_are_rejected() {
        let mut candidate = CandidateRecord::named("AB");
        candidate.address = Some("1 Main St, Example Town".into());
        assert_eq!(validator().check(&candidate), Err(Rejection::NameTooShort));
        assert!(!validator().is_valid(&CandidateRecord::default()));
    }

    #[test]
    fn long_local_description_is_enough() {
        let mut candidate = CandidateRecord::named("Health Clinic");
        candidate.description = Some("Clinic in Example Town, 00000".into());
        assert!(validator().is_valid(&candidate));
    }

    #[test]
    fn locality_is_required() {
        let mut candidate = CandidateRecord::named("Health Clinic");
        candidate.description = Some("Clinic in Elsewhere City, 99999".into());
        assert_eq!(validator().check(&candidate), Err(Rejection::NoLocality));
    }

    #[test]
    fn substance_is_required() {
        let mut candidate = CandidateRecord::named("Example Town Clinic");
        candidate.description = Some("short".into());
        assert_eq!(validator().check(&candidate), Err(Rejection::NoSubstance));

        candidate.phone = Some("(07) 4747 1234".into());
        assert!(validator().is_valid(&candidate));
    }

    #[test]
    fn locality_match_ignores_case_and_may_come_from_address() {
        let mut candidate = CandidateRecord::named("Youth Hub");
        candidate.address = Some("3 Main St, EXAMPLE TOWN".into());
        assert!(validator().is_valid(&candidate));
    }

    #[test]
    fn description_of_exactly_twenty_chars_is_not_substance() {
        let mut candidate = CandidateRecord::named("Example Town Hall");
        candidate.description = Some("a".repeat(20));
        assert_eq!(validator().check(&candidate), Err(Rejection::NoSubstance));
        candidate.description = Some("a".repeat(21));
        assert!(validator().is_valid(&candidate));
    }
}
