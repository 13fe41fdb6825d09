//! Property tests for the naming pure function `derive_public_name`: it
//! should always produce a name (or a rejection under `Error` with a
//! collision) and never panic, regardless of input.

use mcp_hub::config::NamingConfig;
use mcp_hub::models::{derive_public_name, BackendId, NameResolution, NamingStrategy};
use proptest::prelude::*;

fn arb_tool_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_./-]{0,40}"
}

fn arb_backend_id() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,20}"
}

fn naming_with(strategy: NamingStrategy) -> NamingConfig {
    NamingConfig {
        strategy,
        ..NamingConfig::default()
    }
}

proptest! {
    #[test]
    fn derive_public_name_is_identity_under_alias_when_free(tool_name in arb_tool_name(), backend_raw in arb_backend_id()) {
        let backend = BackendId::new(backend_raw).unwrap();
        let naming = naming_with(NamingStrategy::Alias);
        let derived = derive_public_name(&naming, &backend, &tool_name, None, false);
        prop_assert_eq!(derived, NameResolution::Name(tool_name));
    }

    #[test]
    fn derive_public_name_is_total_for_every_strategy(
        tool_name in arb_tool_name(),
        backend_raw in arb_backend_id(),
        strategy_idx in 0..3u8,
        has_alias in any::<bool>(),
        alias in arb_tool_name(),
        bare_name_taken in any::<bool>(),
    ) {
        let backend = BackendId::new(backend_raw).unwrap();
        let strategy = match strategy_idx {
            0 => NamingStrategy::Namespace,
            1 => NamingStrategy::Alias,
            _ => NamingStrategy::Error,
        };
        let naming = naming_with(strategy);
        let alias_ref = has_alias.then_some(alias.as_str());
        let resolution = derive_public_name(&naming, &backend, &tool_name, alias_ref, bare_name_taken);

        if has_alias {
            prop_assert_eq!(resolution, NameResolution::Name(alias));
        } else {
            match strategy {
                NamingStrategy::Namespace => {
                    prop_assert_eq!(resolution, NameResolution::Name(naming.qualify(&backend, &tool_name)));
                }
                NamingStrategy::Alias => {
                    if bare_name_taken {
                        prop_assert_eq!(resolution, NameResolution::Name(naming.qualify(&backend, &tool_name)));
                    } else {
                        prop_assert_eq!(resolution, NameResolution::Name(tool_name));
                    }
                }
                NamingStrategy::Error => {
                    if bare_name_taken {
                        prop_assert_eq!(resolution, NameResolution::Rejected);
                    } else {
                        prop_assert_eq!(resolution, NameResolution::Name(tool_name));
                    }
                }
            }
        }
    }
}
