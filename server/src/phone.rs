/// Class of a chat address, decided by its domain suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Individual,
    Group,
    Broadcast,
}

impl AddressKind {
    pub fn of(raw: &str) -> Self {
        let address = raw.trim().to_ascii_lowercase();
        let Some((user, domain)) = address.split_once('@') else {
            return AddressKind::Individual;
        };
        match domain {
            "g.us" => AddressKind::Group,
            "broadcast" | "newsletter" => AddressKind::Broadcast,
            _ if user == "status" => AddressKind::Broadcast,
            _ => AddressKind::Individual,
        }
    }

    pub fn is_one_to_one(self) -> bool {
        self == AddressKind::Individual
    }
}

/// Canonical dialable phone for a chat address such as
/// `18295319442@s.whatsapp.net`. Returns `None` when no digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let local = raw.split('@').next().unwrap_or_default();
    let digits = local
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        return None;
    }
    // 1XXXXXXXXXX: North American country code left on a 10 digit number.
    if digits.len() == 11 && digits.starts_with('1') {
        return Some(digits[1..].to_string());
    }
    Some(digits)
}
