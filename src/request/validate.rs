//! Input grammar for signup requests.
//!
//! Subdomains become DNS labels and database names become PostgreSQL
//! database identifiers, so both are locked to a conservative charset and
//! the 3–63 length window. Every check returns the exact user-facing
//! message; callers collect them rather than stopping at the first failure.

use once_cell::sync::Lazy;
use regex::Regex;

static SUBDOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("valid subdomain regex"));
static DATABASE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid database name regex"));
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});

/// Why a subdomain was rejected. The API maps each reason to its own
/// `error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubdomainIssue {
    Charset,
    Length,
    HyphenBounded,
}

impl SubdomainIssue {
    pub fn message(&self) -> &'static str {
        match self {
            SubdomainIssue::Charset => {
                "Subdomain can only contain lowercase letters, numbers, and hyphens"
            }
            SubdomainIssue::Length => "Subdomain must be between 3 and 63 characters long",
            SubdomainIssue::HyphenBounded => "Subdomain cannot start or end with a hyphen",
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SubdomainIssue::Length => "INVALID_LENGTH",
            _ => "INVALID_FORMAT",
        }
    }
}

/// Check a subdomain candidate. `None` means acceptable.
pub fn check_subdomain(subdomain: &str) -> Option<SubdomainIssue> {
    if !SUBDOMAIN_RE.is_match(subdomain) {
        return Some(SubdomainIssue::Charset);
    }
    if subdomain.len() < 3 || subdomain.len() > 63 {
        return Some(SubdomainIssue::Length);
    }
    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Some(SubdomainIssue::HyphenBounded);
    }
    None
}

/// Check a database name candidate. `None` means acceptable.
pub fn check_database_name(database_name: &str) -> Option<&'static str> {
    if !DATABASE_NAME_RE.is_match(database_name) {
        return Some("Database name can only contain lowercase letters, numbers, and underscores");
    }
    if database_name.len() < 3 || database_name.len() > 63 {
        return Some("Database name must be between 3 and 63 characters long");
    }
    None
}

pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Derive a database name from a subdomain: hyphens and dots become
/// underscores.
pub fn database_name_from_subdomain(subdomain: &str) -> String {
    subdomain.replace(['-', '.'], "_")
}
