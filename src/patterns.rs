//! Pattern Registry (C2). Pure, synchronous, deterministic: given
//! `(event.kind, entity_ref, selective)` it derives the ordered list of
//! glob-pattern families to target. Never touches the store: selectivity
//! is purely syntactic.

use crate::event::{EntityRef, Event, EventKind, Family, PatternSpec};

/// Default full-mode patterns per family, keyed on the entity id. Mirrors
/// the closed family taxonomy and example templates from the cache key
/// grammar table exactly.
fn full_patterns(family: Family, id: &str, underlying: &str) -> Vec<String> {
    match family {
        Family::Greeks => vec![
            format!("greeks:{id}:*"),
            format!("greeks:chain:{underlying}:*"),
            format!("greeks:bulk:{underlying}:*"),
            format!("greeks:{id}:historical:*"),
        ],
        Family::Indicators => vec![
            format!("indicators:{id}:*"),
            format!("indicators:{id}:*:*"),
            format!("indicators:pattern:{underlying}:*"),
            format!("indicators:signal:{id}:*"),
        ],
        Family::Moneyness => vec![
            format!("moneyness:{id}:*"),
            format!("moneyness:{underlying}:*:*"),
            format!("moneyness:chain:{underlying}:*"),
            format!("moneyness:class:{underlying}:*"),
        ],
        Family::MarketData => vec![
            format!("market_data:{id}:realtime"),
            format!("market_data:{id}:quotes:*"),
            format!("market_data:{id}:depth"),
            format!("market_data:{id}:historical:*"),
        ],
        Family::UserData => vec![
            format!("user_signals:{id}:*"),
            format!("user_portfolio:{id}:*"),
            format!("user_preferences:{id}:*"),
            format!("user_subscriptions:{id}:*"),
        ],
        Family::ChainData => vec![
            format!("chain:{underlying}:*"),
            format!("strikes:{underlying}:*"),
            format!("expiries:{underlying}:*"),
            format!("oi_volume:{underlying}:*"),
        ],
    }
}

/// Appends the temporal qualifier for selective mode. Closed set:
/// `{:current, :h{hour}, :live}`.
fn selective_suffixes(pattern: &str, hour: u32) -> Vec<String> {
    vec![
        format!("{pattern}:current"),
        format!("{pattern}:h{hour}"),
        format!("{pattern}:live"),
    ]
}

fn families_for(kind: EventKind) -> Vec<Family> {
    match kind {
        EventKind::InstrumentUpdate => vec![
            Family::Greeks,
            Family::Indicators,
            Family::Moneyness,
            Family::MarketData,
        ],
        EventKind::ChainRebalance => vec![
            Family::ChainData,
            Family::Moneyness,
            Family::Greeks,
            Family::Indicators,
        ],
        EventKind::SubscriptionChange => vec![Family::UserData],
        EventKind::ExpiryRollover => vec![Family::ChainData, Family::Greeks],
        EventKind::MarketClose => vec![Family::MarketData, Family::Indicators],
        EventKind::CorporateAction => vec![Family::Greeks, Family::Moneyness, Family::ChainData],
    }
}

/// Derives the `PatternSpec` for one event. `hour` is the explicit
/// current-hour input for the `:h{hour}` qualifier, so the function stays
/// pure (no time-of-day reads here).
pub fn derive(event: &Event, selective: bool, hour: u32) -> PatternSpec {
    let (id, underlying) = match &event.entity_ref {
        EntityRef::Instrument(id) => (id.clone(), id.clone()),
        EntityRef::Underlying(u) => (u.clone(), u.clone()),
        EntityRef::User(u) => (u.clone(), u.clone()),
    };

    let mut spec = PatternSpec::new();
    for family in families_for(event.kind) {
        let mut patterns = full_patterns(family, &id, &underlying);
        if selective {
            patterns = patterns
                .iter()
                .flat_map(|p| selective_suffixes(p, hour))
                .collect();
        }
        spec.push(family, patterns);
    }
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    #[test]
    fn deterministic_for_identical_inputs() {
        let event = Event::new(EventKind::InstrumentUpdate, EntityRef::Instrument("NSE:RELIANCE".into()));
        let a = derive(&event, false, 14);
        let b = derive(&event, false, 14);
        assert_eq!(a.len(), b.len());
        for ((fa, pa), (fb, pb)) in a.iter().zip(b.iter()) {
            assert_eq!(fa, fb);
            assert_eq!(pa, pb);
        }
    }

    #[test]
    fn instrument_update_families() {
        let event = Event::new(EventKind::InstrumentUpdate, EntityRef::Instrument("X".into()));
        let spec = derive(&event, false, 0);
        let families: Vec<Family> = spec.families().collect();
        assert_eq!(
            families,
            vec![Family::Greeks, Family::Indicators, Family::Moneyness, Family::MarketData]
        );
    }

    #[test]
    fn subscription_change_has_only_user_data() {
        let event = Event::new(EventKind::SubscriptionChange, EntityRef::User("u-123".into()));
        let spec = derive(&event, false, 0);
        let families: Vec<Family> = spec.families().collect();
        assert_eq!(families, vec![Family::UserData]);
        let (_, patterns) = spec.iter().next().unwrap();
        assert!(patterns.contains(&"user_signals:u-123:*".to_string()));
        assert!(patterns.contains(&"user_portfolio:u-123:*".to_string()));
        assert!(patterns.contains(&"user_preferences:u-123:*".to_string()));
        assert!(patterns.contains(&"user_subscriptions:u-123:*".to_string()));
    }

    #[test]
    fn selective_mode_narrows_full_mode() {
        let event = Event::new(EventKind::ChainRebalance, EntityRef::Underlying("NIFTY".into()));
        let full = derive(&event, false, 10);
        let selective = derive(&event, true, 10);

        // every selective pattern is a suffixed variant of a full pattern
        for (family, sel_patterns) in selective.iter() {
            let (_, full_patterns) = full.iter().find(|(f, _)| f == family).unwrap();
            for sel in sel_patterns {
                assert!(full_patterns.iter().any(|fp| sel.starts_with(fp.as_str())));
            }
        }
    }
}
