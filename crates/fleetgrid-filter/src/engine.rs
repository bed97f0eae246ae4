//! Filter evaluation against the target inventory.

use fleetgrid_state::{ControllerId, Page, PageRequest, StateStore, Target};
use tracing::debug;

use crate::error::FilterResult;
use crate::parser::parse;
use crate::predicate::Predicate;
use crate::query::TargetQuery;
use crate::schema::Schema;

/// Evaluates target filter expressions inside store read transactions.
#[derive(Clone)]
pub struct FilterEngine {
    store: StateStore,
}

impl FilterEngine {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Parse `expr` as a target filter without evaluating it.
    pub fn verify(&self, expr: &str) -> FilterResult<Predicate> {
        parse(expr, Schema::Target)
    }

    pub fn find_targets(&self, expr: &str, page: PageRequest) -> FilterResult<Page<Target>> {
        let predicate = self.verify(expr)?;
        let query = TargetQuery::plan(&predicate)?;
        debug!(filter = %predicate, range = ?query.range, "scanning targets");
        self.store.read(|view| Ok(query.scan(view, page)?))
    }

    /// Matching controller ids in key order.
    pub fn find_target_ids(&self, expr: &str, page: PageRequest) -> FilterResult<Page<ControllerId>> {
        Ok(self.find_targets(expr, page)?.map(|t| t.controller_id))
    }

    pub fn count_targets(&self, expr: &str) -> FilterResult<usize> {
        Ok(self.find_targets(expr, PageRequest::first(0))?.total)
    }

    pub fn matches(&self, expr: &str, target: &Target) -> FilterResult<bool> {
        let predicate = self.verify(expr)?;
        Ok(predicate.compile()?.matches(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use fleetgrid_state::StateResult;

    fn seeded_engine() -> FilterEngine {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|s| -> StateResult<()> {
                for i in 0..20 {
                    let mut target = Target::new(&format!("dev-{i:02}"), &format!("device {i}"), 1000 + i);
                    if i % 4 == 0 {
                        target.attributes.insert("region".into(), "eu".into());
                    }
                    s.put_target(&target)?;
                }
                s.put_target(&Target::new("gw-01", "gateway", 1000))
            })
            .unwrap();
        FilterEngine::new(store)
    }

    #[test]
    fn finds_pages_in_key_order() {
        let engine = seeded_engine();
        let page = engine
            .find_target_ids("attribute.region==EU", PageRequest::new(2, 2))
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.content, ["dev-08", "dev-12"]);
    }

    #[test]
    fn counts_without_materializing() {
        let engine = seeded_engine();
        assert_eq!(engine.count_targets("controllerId==dev-*").unwrap(), 20);
        assert_eq!(engine.count_targets("controllerId==GW-01").unwrap(), 1);
        assert_eq!(engine.count_targets("name==gateway,createdAt>=1019").unwrap(), 2);
    }

    #[test]
    fn errors_surface_before_scanning() {
        let engine = seeded_engine();
        assert!(matches!(
            engine.find_targets("colour==red", PageRequest::all()),
            Err(FilterError::UnsupportedField { .. })
        ));
        assert!(matches!(
            engine.count_targets("name=="),
            Err(FilterError::Syntax { .. })
        ));
    }

    #[test]
    fn matches_single_target() {
        let engine = seeded_engine();
        let target = Target::new("dev-99", "spare", 0);
        assert!(engine.matches("name==spare", &target).unwrap());
        assert!(!engine.matches("attribute.region==eu", &target).unwrap());
    }
}
