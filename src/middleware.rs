//! # Request Middleware
//!
//! Cross-cutting processing applied to every outgoing broker request and to
//! caller input before any network call is made.
//!
//! ## Middleware Types
//!
//! - **Auth Headers**: Attaches the bearer credential and the admin secret
//! - **Validation Middleware**: Validates keys, content types, lifetimes and
//!   part numbers
//!
//! ## Usage Examples
//!
//! ```ignore
//! let request = AuthHeaders::apply(client.post(url), &token, &admin_secret);
//! ValidationMiddleware::validate_object_key("audio/track.mp3")?;
//! ```

use crate::constants::{HEADER_ADMIN_SECRET, MAX_GRANT_TTL_SECS, MAX_PART_COUNT};
use crate::errors::{AppError, AppResult};
use crate::models::Secret;

/// Attaches credentials to outgoing broker requests.
///
/// The bearer token goes in `Authorization`; the admin secret is forwarded
/// opaquely in its own header. Neither value is ever logged.
pub struct AuthHeaders;

impl AuthHeaders {
    /// Returns the request with both credential headers set.
    ///
    /// # Arguments
    ///
    /// * `request` - The request being built
    /// * `bearer` - Session token, or the identity token when authenticating
    /// * `admin_secret` - Out-of-band shared secret
    pub fn apply(
        request: reqwest::RequestBuilder,
        bearer: &Secret,
        admin_secret: &Secret,
    ) -> reqwest::RequestBuilder {
        request
            .bearer_auth(bearer.expose())
            .header(HEADER_ADMIN_SECRET, admin_secret.expose())
    }
}

/// Validation of caller-supplied parameters.
///
/// All methods return `AppResult` so they compose with `?` at the start of an
/// operation, before anything is sent over the network.
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    /// Validates that both credentials are present.
    ///
    /// # Errors
    ///
    /// - `MissingField`: If either credential is empty
    pub fn validate_credentials(identity_token: &Secret, admin_secret: &Secret) -> AppResult<()> {
        if identity_token.is_empty() {
            return Err(AppError::MissingField {
                field: "identity token".to_string(),
            });
        }
        if admin_secret.is_empty() {
            return Err(AppError::MissingField {
                field: "admin secret".to_string(),
            });
        }
        Ok(())
    }

    /// Validates an object key.
    ///
    /// # Rules
    ///
    /// - Non-empty and at most 1024 bytes
    /// - No leading `/`, no `.` or `..` segments, no empty segments
    /// - No control characters
    ///
    /// # Errors
    ///
    /// - `InvalidField`: If any rule is violated
    pub fn validate_object_key(key: &str) -> AppResult<()> {
        let invalid = |reason: &str| AppError::InvalidField {
            field: "key".to_string(),
            reason: format!("{} ({:?})", reason, key),
        };

        if key.trim().is_empty() {
            return Err(invalid("must not be empty"));
        }
        if key.len() > 1024 {
            return Err(invalid("longer than 1024 bytes"));
        }
        if key.starts_with('/') {
            return Err(invalid("must not start with '/'"));
        }
        if key.chars().any(|c| c.is_control()) {
            return Err(invalid("contains control characters"));
        }
        if key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(invalid("contains an empty or relative segment"));
        }
        Ok(())
    }

    /// Validates that a content type has the `type/subtype` shape.
    ///
    /// # Errors
    ///
    /// - `InvalidField`: If the content type is malformed
    pub fn validate_content_type(content_type: &str) -> AppResult<()> {
        let well_formed = match content_type.split_once('/') {
            Some((kind, rest)) => {
                let subtype = rest.split(';').next().unwrap_or_default().trim();
                !kind.is_empty()
                    && !subtype.is_empty()
                    && !kind.contains(char::is_whitespace)
                    && !content_type.chars().any(|c| c.is_control())
            }
            None => false,
        };

        if !well_formed {
            return Err(AppError::InvalidField {
                field: "contentType".to_string(),
                reason: format!("'{}' is not a valid MIME type", content_type),
            });
        }
        Ok(())
    }

    /// Validates a requested grant lifetime.
    ///
    /// # Errors
    ///
    /// - `InvalidField`: If the lifetime is zero or above the maximum
    pub fn validate_expires_in(expires_in_secs: u64) -> AppResult<()> {
        if expires_in_secs == 0 || expires_in_secs > MAX_GRANT_TTL_SECS {
            return Err(AppError::InvalidField {
                field: "expiresIn".to_string(),
                reason: format!("must be between 1 and {} seconds", MAX_GRANT_TTL_SECS),
            });
        }
        Ok(())
    }

    /// Validates a 1-based part number.
    pub fn validate_part_number(part_number: u32) -> AppResult<()> {
        if part_number == 0 || part_number > MAX_PART_COUNT {
            return Err(AppError::InvalidField {
                field: "partNumber".to_string(),
                reason: format!("must be between 1 and {}", MAX_PART_COUNT),
            });
        }
        Ok(())
    }
}
