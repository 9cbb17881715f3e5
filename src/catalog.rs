//! Fixed lists offered to clients when filling in a booking.
//! Static data only; booking never checks values against them.

pub const VETERINARIANS: &[&str] = &["Dr. Lopez", "Dr. Ramirez", "Dr. Martinez", "Dr. Gonzalez"];

pub const SPECIES: &[&str] = &["Dog", "Cat", "Bird", "Other"];

/// Species that may not share a timestamp with each other.
pub const INCOMPATIBLE_SPECIES: &[&str] = &["dog", "cat"];

pub fn is_incompatible_species(species: &str) -> bool {
    INCOMPATIBLE_SPECIES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(species.trim()))
}
