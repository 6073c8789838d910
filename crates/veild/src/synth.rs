use rand::Rng;

use veil_core::types::{PostalAddress, RecordId, SourceRecord};
use veil_observe::time::unix_time_ms;

const GIVEN_NAMES: &[&str] = &[
    "Alice", "Bruno", "Chloe", "Dmitri", "Elena", "Farid", "Greta", "Hugo", "Ines", "Jonas",
    "Klara", "Luca", "Mara", "Nils", "Olga", "Pavel",
];

const FAMILY_NAMES: &[&str] = &[
    "Archer", "Bergmann", "Castillo", "Dvorak", "Eriksen", "Fontaine", "Gruber", "Horvat",
    "Ivanov", "Jansen", "Kowalski", "Lindgren", "Moreau", "Novak", "Okafor", "Petrov",
];

const STREETS: &[&str] = &[
    "Station Road", "High Street", "Mill Lane", "Church Street", "Park Avenue", "Canal Walk",
];

const CITIES: &[(&str, &str, &str)] = &[
    ("Bristol", "Somerset", "GB"),
    ("Utrecht", "Utrecht", "NL"),
    ("Graz", "Styria", "AT"),
    ("Porto", "Norte", "PT"),
];

const DOMAINS: &[&str] = &["example.com", "mail.test", "post.example"];

/// One synthetic person record for demo load. Sequence number keeps ids
/// unique; the creation timestamp is the wall clock, which is monotone
/// enough for the watermark's "not older than" semantics.
pub fn synthetic_record<R: Rng>(rng: &mut R, seq: u64) -> SourceRecord {
    let given = GIVEN_NAMES[rng.gen_range(0..GIVEN_NAMES.len())];
    let family = FAMILY_NAMES[rng.gen_range(0..FAMILY_NAMES.len())];
    let street = STREETS[rng.gen_range(0..STREETS.len())];
    let (city, region, country) = CITIES[rng.gen_range(0..CITIES.len())];
    let domain = DOMAINS[rng.gen_range(0..DOMAINS.len())];

    SourceRecord {
        id: RecordId(format!("synth-{seq:08}")),
        given_name: given.to_string(),
        family_name: family.to_string(),
        email: format!("{}.{}{}@{domain}", given.to_lowercase(), family.to_lowercase(), seq),
        address: PostalAddress {
            line1: format!("{} {street}", rng.gen_range(1..200)),
            line2: String::new(),
            postcode: format!("{:05}", rng.gen_range(10_000..100_000)),
            city: city.to_string(),
            region: region.to_string(),
            country: country.to_string(),
        },
        created_at_unix_ms: unix_time_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn synthetic_records_are_unique_by_sequence() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = synthetic_record(&mut rng, 0);
        let b = synthetic_record(&mut rng, 1);
        assert_ne!(a.id, b.id);
        assert!(a.validate().is_ok());
        assert!(a.email.contains('@'));
    }
}
