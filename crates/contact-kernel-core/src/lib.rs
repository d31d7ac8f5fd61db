use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ContactError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// One stored contact row. Emails are lowercased before they reach this type
/// and are never re-normalized on read.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ContactRecord {
    /// Validate one stored contact row against the link invariants.
    ///
    /// # Errors
    /// Returns [`ContactError::Integrity`] when the row carries no identifier,
    /// a primary carries a back-reference, or a secondary is missing one.
    pub fn validate(&self) -> Result<(), ContactError> {
        if self.email.is_none() && self.phone_number.is_none() {
            return Err(ContactError::Integrity(format!(
                "contact {} has neither email nor phone number",
                self.id
            )));
        }

        match self.link_precedence {
            LinkPrecedence::Primary => {
                if self.linked_id.is_some() {
                    return Err(ContactError::Integrity(format!(
                        "primary contact {} must not carry linked_id",
                        self.id
                    )));
                }
            }
            LinkPrecedence::Secondary => {
                if self.linked_id.is_none() {
                    return Err(ContactError::Integrity(format!(
                        "secondary contact {} is missing linked_id",
                        self.id
                    )));
                }
            }
        }

        Ok(())
    }
}

#[must_use]
pub fn normalize_email(raw: &str) -> String {
    raw.to_lowercase()
}

/// A normalized identify request: at least one identifier, email lowercased.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IdentityQuery {
    email: Option<String>,
    phone_number: Option<String>,
}

impl IdentityQuery {
    /// Build a query from raw caller input, lowercasing the email.
    ///
    /// # Errors
    /// Returns [`ContactError::Validation`] when both identifiers are absent
    /// or a supplied identifier is blank.
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Result<Self, ContactError> {
        if email.is_none() && phone_number.is_none() {
            return Err(ContactError::Validation(
                "at least one of email or phone number MUST be provided".to_string(),
            ));
        }

        if let Some(value) = email {
            if value.trim().is_empty() {
                return Err(ContactError::Validation("email MUST be non-empty".to_string()));
            }
        }
        if let Some(value) = phone_number {
            if value.trim().is_empty() {
                return Err(ContactError::Validation("phone number MUST be non-empty".to_string()));
            }
        }

        Ok(Self {
            email: email.map(normalize_email),
            phone_number: phone_number.map(ToString::to_string),
        })
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

/// The mutation the store must apply for one identify request.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ReconciliationPlan {
    /// No stored record shares an identifier: insert a fresh primary.
    CreatePrimary,
    /// Every supplied identifier is already known within a single linked
    /// group: answer from the canonical record, mutate nothing.
    AlreadyKnown { canonical: ContactRecord },
    /// Re-point `relink` at the canonical record, flip absorbed primaries to
    /// secondary, then insert one secondary carrying the request's values.
    Reconcile {
        canonical: ContactRecord,
        relink: Vec<ContactId>,
        absorbed_primaries: Vec<ContactId>,
    },
}

/// Derive the set of primary ids reachable from the matched records: a
/// primary contributes its own id, a secondary contributes its back-reference.
///
/// # Errors
/// Returns [`ContactError::Integrity`] when a matched secondary has no
/// `linked_id` to follow.
pub fn touched_primary_ids(matched: &[ContactRecord]) -> Result<BTreeSet<ContactId>, ContactError> {
    let mut touched = BTreeSet::new();
    for record in matched {
        match record.link_precedence {
            LinkPrecedence::Primary => {
                touched.insert(record.id);
            }
            LinkPrecedence::Secondary => {
                let linked_id = record.linked_id.ok_or_else(|| {
                    ContactError::Integrity(format!(
                        "secondary contact {} is missing linked_id",
                        record.id
                    ))
                })?;
                touched.insert(linked_id);
            }
        }
    }
    Ok(touched)
}

/// Select the canonical record among the touched primaries: earliest
/// `created_at`, ties broken by lowest id.
///
/// # Errors
/// Returns [`ContactError::Integrity`] when the set is empty or contains a
/// record that is not a primary.
pub fn select_canonical(primaries: &[ContactRecord]) -> Result<&ContactRecord, ContactError> {
    for record in primaries {
        if record.link_precedence != LinkPrecedence::Primary {
            return Err(ContactError::Integrity(format!(
                "contact {} was loaded as a touched primary but is secondary",
                record.id
            )));
        }
    }

    primaries
        .iter()
        .min_by(|lhs, rhs| {
            lhs.created_at.cmp(&rhs.created_at).then_with(|| lhs.id.cmp(&rhs.id))
        })
        .ok_or_else(|| ContactError::Integrity("no touched primaries to select from".to_string()))
}

/// Classify one identify request against its matched records and compute the
/// mutation, if any. `primaries` must hold exactly the full records for the
/// touched primary ids derived from `matched`.
///
/// # Errors
/// Returns [`ContactError::Integrity`] when the stored state is inconsistent:
/// a secondary without a back-reference, a touched primary that was not
/// loaded, or a loaded record that is not a primary.
pub fn plan_reconciliation(
    matched: &[ContactRecord],
    primaries: &[ContactRecord],
    query: &IdentityQuery,
) -> Result<ReconciliationPlan, ContactError> {
    if matched.is_empty() {
        return Ok(ReconciliationPlan::CreatePrimary);
    }

    let touched = touched_primary_ids(matched)?;
    let loaded = primaries.iter().map(|record| record.id).collect::<BTreeSet<_>>();
    if touched != loaded {
        return Err(ContactError::Integrity(format!(
            "touched primaries {touched:?} do not match loaded records {loaded:?}"
        )));
    }

    let canonical = select_canonical(primaries)?.clone();

    // A single-group request that introduces no new identifier is a repeat of
    // known information: answer without mutating and without inserting.
    if touched.len() == 1 && request_fully_known(matched, query) {
        return Ok(ReconciliationPlan::AlreadyKnown { canonical });
    }

    let mut relink = BTreeSet::new();
    for record in matched {
        if record.id == canonical.id {
            continue;
        }
        let already_consistent = record.link_precedence == LinkPrecedence::Secondary
            && record.linked_id == Some(canonical.id);
        if !already_consistent {
            relink.insert(record.id);
        }
    }

    let mut absorbed_primaries = Vec::new();
    for id in &touched {
        if *id != canonical.id {
            relink.insert(*id);
            absorbed_primaries.push(*id);
        }
    }

    Ok(ReconciliationPlan::Reconcile {
        canonical,
        relink: relink.into_iter().collect(),
        absorbed_primaries,
    })
}

fn request_fully_known(matched: &[ContactRecord], query: &IdentityQuery) -> bool {
    let email_known = query.email().map_or(true, |email| {
        matched.iter().any(|record| record.email.as_deref() == Some(email))
    });
    let phone_known = query.phone_number().map_or(true, |phone| {
        matched.iter().any(|record| record.phone_number.as_deref() == Some(phone))
    });
    email_known && phone_known
}

/// The deduplicated aggregate view of one resolved identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContactResponse {
    pub contact: ContactSummary,
}

/// Assemble the aggregate response for a canonical record and its linked
/// secondaries: canonical values first, then each secondary's values in store
/// order, first occurrence wins.
///
/// # Errors
/// Returns [`ContactError::Integrity`] when `primary` is not a primary record
/// or a listed secondary does not point back at it.
pub fn assemble_contact(
    primary: &ContactRecord,
    secondaries: &[ContactRecord],
) -> Result<ContactResponse, ContactError> {
    if primary.link_precedence != LinkPrecedence::Primary {
        return Err(ContactError::Integrity(format!(
            "contact {} is not a primary record",
            primary.id
        )));
    }

    let mut emails = Vec::new();
    let mut phone_numbers = Vec::new();
    let mut secondary_contact_ids = Vec::new();

    push_unique(&mut emails, primary.email.as_deref());
    push_unique(&mut phone_numbers, primary.phone_number.as_deref());

    for record in secondaries {
        if record.linked_id != Some(primary.id) {
            return Err(ContactError::Integrity(format!(
                "contact {} is not linked to primary {}",
                record.id, primary.id
            )));
        }
        push_unique(&mut emails, record.email.as_deref());
        push_unique(&mut phone_numbers, record.phone_number.as_deref());
        secondary_contact_ids.push(record.id);
    }

    Ok(ContactResponse {
        contact: ContactSummary {
            primary_contact_id: primary.id,
            emails,
            phone_numbers,
            secondary_contact_ids,
        },
    })
}

/// Fold the request's own identifiers into an aggregate that was computed
/// before the request's secondary row was inserted. The submitted values show
/// up in the response lists; the freshly inserted row id never does.
pub fn merge_query_values(response: &mut ContactResponse, query: &IdentityQuery) {
    push_unique(&mut response.contact.emails, query.email());
    push_unique(&mut response.contact.phone_numbers, query.phone_number());
}

fn push_unique(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}
