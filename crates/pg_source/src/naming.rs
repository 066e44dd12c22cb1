use common::{
    identifiers::sanitize_ident,
    mirror::MirrorName,
};

const SLOT_PREFIX: &str = "bunny_slot_";
const PUBLICATION_PREFIX: &str = "bunny_pub_";

pub fn slot_name(mirror: &MirrorName) -> String {
    sanitize_ident(&format!("{SLOT_PREFIX}{mirror}"))
}

pub fn publication_name(mirror: &MirrorName) -> String {
    sanitize_ident(&format!("{PUBLICATION_PREFIX}{mirror}"))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use common::mirror::MirrorName;

    use super::*;

    #[test]
    fn names_are_prefixed_and_sanitized() {
        let mirror = MirrorName::from_str("orders-prod.v2").unwrap();
        assert_eq!(slot_name(&mirror), "bunny_slot_orders_prod_v2");
        assert_eq!(publication_name(&mirror), "bunny_pub_orders_prod_v2");
    }

    #[test]
    fn long_names_stay_within_identifier_limit() {
        let mirror = MirrorName::from_str(&"m".repeat(120)).unwrap();
        assert!(slot_name(&mirror).len() <= 63);
        assert!(publication_name(&mirror).len() <= 63);
    }
}
