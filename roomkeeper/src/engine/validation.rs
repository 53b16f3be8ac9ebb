/// Maximum length of a Matrix identifier, in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Validate a fully qualified user id: `@localpart:server`.
pub fn validate_user_id(user_id: &str) -> Result<(), String> {
    validate_sigil_id(user_id, '@', "User id")
}

/// Validate a room id: `!opaque:server`.
pub fn validate_room_id(room_id: &str) -> Result<(), String> {
    validate_sigil_id(room_id, '!', "Room id")
}

fn validate_sigil_id(id: &str, sigil: char, what: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{what} cannot be empty"));
    }
    if id.len() > MAX_IDENTIFIER_LENGTH {
        return Err(format!(
            "{what} too long (max {} bytes)",
            MAX_IDENTIFIER_LENGTH
        ));
    }
    if !id.starts_with(sigil) {
        return Err(format!("{what} must start with '{sigil}'"));
    }
    match id[1..].split_once(':') {
        Some((local, server)) if !local.is_empty() && !server.is_empty() => Ok(()),
        _ => Err(format!("{what} must have the form {sigil}name:server")),
    }
}

/// The server part of a user id, only when the id has exactly one colon.
///
/// Ids with an explicit port (`@a:host:8448`) or other extra colons yield
/// `None`, so they never match a personal server by suffix.
pub fn single_server_part(user_id: &str) -> Option<&str> {
    if user_id.matches(':').count() != 1 {
        return None;
    }
    user_id.split_once(':').map(|(_, server)| server)
}

/// Validate a homeserver base URL.
pub fn validate_homeserver(url: &str) -> Result<(), String> {
    if url.trim().is_empty() {
        return Err("Homeserver URL cannot be empty".into());
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err("Homeserver URL must start with http:// or https://".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_user_ids() {
        assert!(validate_user_id("@alice:example.com").is_ok());
        assert!(validate_user_id("@bot:example.com:8448").is_ok());
    }

    #[test]
    fn test_invalid_user_ids() {
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("alice:example.com").is_err());
        assert!(validate_user_id("@alice").is_err());
        assert!(validate_user_id("@:example.com").is_err());
        assert!(validate_user_id(&format!("@{}:x", "a".repeat(300))).is_err());
    }

    #[test]
    fn test_room_ids() {
        assert!(validate_room_id("!abc:example.com").is_ok());
        assert!(validate_room_id("#alias:example.com").is_err());
    }

    #[test]
    fn test_single_server_part() {
        assert_eq!(single_server_part("@a:example.com"), Some("example.com"));
        assert_eq!(single_server_part("@a:example.com:8448"), None);
        assert_eq!(single_server_part("@a"), None);
    }

    #[test]
    fn test_homeserver() {
        assert!(validate_homeserver("https://example.com:8448").is_ok());
        assert!(validate_homeserver("").is_err());
        assert!(validate_homeserver("example.com").is_err());
    }
}
