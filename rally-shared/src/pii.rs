use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps payer contact details (email, phone) so they never leak through
/// `Debug`/`Display` in log macros. Serialization keeps the real value because
/// the invite flow has to hand it back to the client that supplied it.
#[derive(Clone, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "********")
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    pub fn expose(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_is_hidden_from_debug_output() {
        let contact = Masked::new("ana@example.com".to_string());
        assert_eq!(format!("{:?}", contact), "********");
        assert_eq!(format!("{}", contact), "********");
    }

    #[test]
    fn contact_survives_serialization() {
        let contact = Masked::new("ana@example.com".to_string());
        let json = serde_json::to_string(&contact).unwrap();
        assert_eq!(json, "\"ana@example.com\"");
        let back: Masked<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, contact);
    }
}
