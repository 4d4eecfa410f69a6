//! Property tests for vault names, config value sanitizing and redaction.

use kms_plugin::auth::redact;
use kms_plugin::keyvault::AzureCloud;
use kms_plugin::keyvault::cloud::vault_url;
use kms_plugin::utils::sanitize_string;
use proptest::prelude::*;

const MASK: &str = "##### REDACTED #####";

fn clouds() -> impl Strategy<Value = AzureCloud> {
    prop_oneof![
        Just(AzureCloud::Public),
        Just(AzureCloud::China),
        Just(AzureCloud::UsGovernment),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Names of 3 to 24 allowed characters always produce a vault URL.
    #[test]
    fn valid_vault_names_accepted(name in "[-a-zA-Z0-9]{3,24}", cloud in clouds()) {
        let url = vault_url(&name, false, cloud).unwrap();
        let prefix = format!("https://{name}.vault.");
        prop_assert!(url.starts_with(&prefix));
        if cloud == AzureCloud::Public {
            prop_assert_eq!(url, format!("https://{name}.vault.azure.net/"));
        }
    }

    /// Names outside the length bounds are rejected.
    #[test]
    fn out_of_bounds_vault_names_rejected(
        name in prop_oneof!["[-a-zA-Z0-9]{0,2}", "[-a-zA-Z0-9]{25,40}"],
        cloud in clouds()
    ) {
        prop_assert!(vault_url(&name, false, cloud).is_err());
    }

    /// Any disallowed character is rejected.
    #[test]
    fn invalid_vault_characters_rejected(
        prefix in "[a-z]{1,10}",
        bad in "[_./ @!]",
        suffix in "[a-z]{1,10}",
        cloud in clouds()
    ) {
        let name = format!("{prefix}{bad}{suffix}");
        prop_assert!(vault_url(&name, false, cloud).is_err());
    }

    /// Sanitizing is a fixed point.
    #[test]
    fn sanitize_is_idempotent(value in "[ \"\t\na-z0-9-]{0,32}") {
        let once = sanitize_string(&value);
        prop_assert_eq!(sanitize_string(&once), once.clone());
        prop_assert!(!once.starts_with('"') && !once.ends_with('"'));
        prop_assert_eq!(once.trim(), once.as_str());
    }

    /// Long values keep only their first and last four characters.
    #[test]
    fn long_values_keep_ends(value in "[!-~]{8,64}") {
        let redacted = redact(&value);
        prop_assert_eq!(
            redacted,
            format!("{}{MASK}{}", &value[..4], &value[value.len() - 4..])
        );
    }

    /// Short values are fully masked.
    #[test]
    fn short_values_fully_masked(value in "[!-~]{0,7}") {
        prop_assert_eq!(redact(&value), MASK);
    }
}
