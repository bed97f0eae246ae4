//! Planning target predicates into store scans.

use fleetgrid_state::{KeyRange, Page, PageRequest, StateResult, StoreView, Target};

use crate::compiled::CompiledFilter;
use crate::error::FilterResult;
use crate::predicate::{Comparison, Literal, Operator, Predicate};
use crate::schema::Field;

/// A target predicate narrowed to a key range plus a residual matcher.
#[derive(Debug, Clone)]
pub struct TargetQuery {
    pub range: KeyRange,
    filter: CompiledFilter,
}

impl TargetQuery {
    /// Plan `predicate`: a top-level `controllerId==literal` becomes an exact
    /// key lookup and `controllerId==prefix*` a prefix scan. The full
    /// predicate is still applied to every visited target.
    pub fn plan(predicate: &Predicate) -> FilterResult<Self> {
        let range = match predicate {
            Predicate::Compare(c) => key_range(c),
            Predicate::And(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    Predicate::Compare(c) => key_range(c),
                    _ => None,
                })
                .min_by_key(selectivity),
            _ => None,
        }
        .unwrap_or(KeyRange::All);

        Ok(Self {
            range,
            filter: predicate.compile()?,
        })
    }

    pub fn matches(&self, target: &Target) -> bool {
        self.filter.matches(target)
    }

    /// Run the query inside an open transaction.
    pub fn scan(&self, view: &impl StoreView, page: PageRequest) -> StateResult<Page<Target>> {
        view.scan_targets(&self.range, &|t| self.filter.matches(t), page)
    }
}

fn key_range(c: &Comparison) -> Option<KeyRange> {
    if c.field != Field::ControllerId || c.op != Operator::Eq {
        return None;
    }
    let Some(Literal::Text(value)) = c.values.first() else {
        return None;
    };
    match value.find('*') {
        None => Some(KeyRange::Exact(value.clone())),
        Some(0) => None,
        Some(star) => Some(KeyRange::Prefix(value[..star].to_string())),
    }
}

fn selectivity(range: &KeyRange) -> usize {
    match range {
        KeyRange::Exact(_) => 0,
        KeyRange::Prefix(p) => usize::MAX - p.len(),
        KeyRange::All => usize::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::schema::Schema;

    fn plan(expr: &str) -> KeyRange {
        TargetQuery::plan(&parse(expr, Schema::Target).unwrap()).unwrap().range
    }

    #[test]
    fn exact_and_prefix_plans() {
        assert_eq!(plan("controllerId==dev-1"), KeyRange::Exact("dev-1".into()));
        assert_eq!(plan("id==dev-*"), KeyRange::Prefix("dev-".into()));
        assert_eq!(plan("controllerId==*-1"), KeyRange::All);
        assert_eq!(plan("name==dev-1"), KeyRange::All);
        assert_eq!(plan("controllerId==a,controllerId==b"), KeyRange::All);
        assert_eq!(plan("not controllerId==a"), KeyRange::All);
    }

    #[test]
    fn conjunction_uses_the_narrowest_key_range() {
        assert_eq!(
            plan("updateLocked==false;controllerId==gw-*;controllerId==gw-eu-*"),
            KeyRange::Prefix("gw-eu-".into())
        );
        assert_eq!(
            plan("controllerId==gw-*;controllerId==gw-1"),
            KeyRange::Exact("gw-1".into())
        );
    }

    #[test]
    fn residual_still_applies() {
        let query = TargetQuery::plan(&parse("controllerId==dev-*;name==b", Schema::Target).unwrap()).unwrap();
        let mut target = Target::new("dev-1", "a", 0);
        assert!(!query.matches(&target));
        target.name = "B".into();
        assert!(query.matches(&target));
    }
}
