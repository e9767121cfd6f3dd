use super::identity::Role;
use super::session::SessionStore;

/// Outcome of a route guard check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted,
    /// Not signed in; send the user to login and come back afterwards.
    LoginRequired { return_to: String },
    /// Signed in without the required role.
    Forbidden,
}

/// Decide whether the current session may open `requested`.
///
/// A session whose access token has expired still counts as signed in: the
/// next authenticated call refreshes it transparently.
pub fn authorize(store: &SessionStore, required: Option<Role>, requested: &str) -> Access {
    let Some(identity) = store.identity() else {
        return Access::LoginRequired {
            return_to: requested.to_string(),
        };
    };

    match required {
        Some(role) if !identity.has_role(role) => Access::Forbidden,
        _ => Access::Granted,
    }
}
