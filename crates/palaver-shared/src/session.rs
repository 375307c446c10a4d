//! Session schema handed over by the identity provider.
//!
//! The provider's payload is untrusted input: [`Session::from_value`] checks
//! every field and reports all issues at once instead of stopping at the
//! first one.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;
use crate::types::{Role, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionUser {
    pub id: UserId,
    pub name: Option<String>,
    pub email: Option<String>,
    pub image: Option<String>,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user: SessionUser,
}

impl Session {
    /// Parse the raw session string, if the provider sent one.
    pub fn from_raw(raw: Option<&str>) -> Result<Self, SessionError> {
        let raw = raw.ok_or(SessionError::Missing)?;
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| SessionError::Invalid(vec![format!("session is not JSON: {e}")]))?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self, SessionError> {
        let mut issues = Vec::new();

        let Some(user) = value.get("user").and_then(Value::as_object) else {
            return Err(SessionError::Invalid(vec![
                "user: expected an object".to_string()
            ]));
        };

        let id = match user.get("id").and_then(Value::as_str) {
            Some(raw) => match UserId::parse(raw) {
                Ok(id) => Some(id),
                Err(e) => {
                    issues.push(format!("user.id: {e}"));
                    None
                }
            },
            None => {
                issues.push("user.id: required string".to_string());
                None
            }
        };

        let role = match user.get("role").and_then(Value::as_str) {
            Some(raw) => match raw.parse::<Role>() {
                Ok(role) => Some(role),
                Err(e) => {
                    issues.push(format!("user.role: {e}"));
                    None
                }
            },
            None => {
                issues.push("user.role: required string".to_string());
                None
            }
        };

        let name = optional_string(user.get("name"), "user.name", &mut issues);
        let email = optional_string(user.get("email"), "user.email", &mut issues);
        let image = optional_string(user.get("image"), "user.image", &mut issues);

        if let Some(email) = &email {
            if !email.contains('@') {
                issues.push(format!("user.email: not an email address: {email}"));
            }
        }

        match (id, role) {
            (Some(id), Some(role)) if issues.is_empty() => Ok(Session {
                user: SessionUser {
                    id,
                    name,
                    email,
                    image,
                    role,
                },
            }),
            _ => Err(SessionError::Invalid(issues)),
        }
    }
}

fn optional_string(value: Option<&Value>, field: &str, issues: &mut Vec<String>) -> Option<String> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            issues.push(format!("{field}: expected a string"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_session() {
        assert_eq!(Session::from_raw(None), Err(SessionError::Missing));
    }

    #[test]
    fn test_valid_session() {
        let id = UserId::new();
        let value = json!({
            "user": {"id": id.to_string(), "name": "Ada", "email": "ada@example.com", "image": null, "role": "user"}
        });
        let session = Session::from_value(&value).unwrap();
        assert_eq!(session.user.id, id);
        assert_eq!(session.user.role, Role::User);
        assert_eq!(session.user.image, None);
    }

    #[test]
    fn test_all_issues_reported() {
        let value = json!({
            "user": {"id": "nope", "email": 42, "role": "superuser"}
        });
        let Err(SessionError::Invalid(issues)) = Session::from_value(&value) else {
            panic!("expected invalid session");
        };
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().any(|i| i.starts_with("user.id")));
        assert!(issues.iter().any(|i| i.starts_with("user.role")));
        assert!(issues.iter().any(|i| i.starts_with("user.email")));
    }

    #[test]
    fn test_not_json() {
        assert!(matches!(
            Session::from_raw(Some("{{")),
            Err(SessionError::Invalid(_))
        ));
    }
}
