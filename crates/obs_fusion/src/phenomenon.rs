//! Phenomenon lookup and per-procedure composition.
//!
//! A procedure's observations may reference singles, composites or a mix of
//! both over time. [`PhenomenonResolver::resolve_global_composite`] folds them
//! into one phenomenon describing the whole procedure.

use std::collections::HashSet;

use tracing::debug;

use crate::backend::StoreConnection;
use crate::cache::SessionCache;
use crate::catalog::FieldCatalog;
use crate::error::Result;
use crate::filter::FilterQuery;
use crate::model::{CompositePhenomenon, Phenomenon, SinglePhenomenon};

/// Id prefix of composites synthesized from a procedure's fields.
pub const VIRTUAL_COMPOSITE_PREFIX: &str = "computed-phen-";

/// Protocol version whose requests use the legacy global ids.
pub const LEGACY_VERSION: &str = "1.0.0";

const LEGACY_RENAMES: &[(&str, &str)] = &[
    ("urn:ogc:def:phenomenon:GEOSS:aggregate", "aggregatePhenomenon"),
    ("urn:ogc:def:phenomenon:GEOSS:depth", "depth"),
    ("urn:ogc:def:phenomenon:GEOSS:temperature", "temperature"),
];

/// Stored id of `id` for a request of `version`.
pub fn storage_id<'a>(version: Option<&str>, id: &'a str) -> &'a str {
    if version != Some(LEGACY_VERSION) {
        return id;
    }
    LEGACY_RENAMES
        .iter()
        .find(|(legacy, _)| *legacy == id)
        .map(|(_, renamed)| *renamed)
        .unwrap_or(id)
}

/// Outcome of folding the phenomena of one procedure.
#[derive(Debug, Clone, PartialEq)]
pub enum Composition {
    /// No phenomenon is referenced.
    Empty,
    Resolved(Phenomenon),
    /// Several singles without composite: synthesize from the field catalog.
    NeedsVirtual,
}

/// Folds distinct phenomena into the procedure-wide one.
pub fn compose(candidates: Vec<Phenomenon>) -> Composition {
    let mut candidates = candidates;
    if candidates.len() <= 1 {
        return candidates
            .pop()
            .map(Composition::Resolved)
            .unwrap_or(Composition::Empty);
    }
    let mut singles = Vec::new();
    let mut composites = Vec::new();
    for candidate in candidates {
        match candidate {
            Phenomenon::Single(single) => singles.push(single),
            Phenomenon::Composite(composite) => composites.push(composite),
        }
    }
    if composites.is_empty() {
        return Composition::NeedsVirtual;
    }
    let chosen = if singles.is_empty() {
        widest_composite(&composites)
    } else {
        covering_composite(&composites, &singles)
    };
    Composition::Resolved(Phenomenon::Composite(chosen.clone()))
}

/// Composite whose components include every other composite's, else the one
/// with most components; ties go to the smallest id.
fn widest_composite(composites: &[CompositePhenomenon]) -> &CompositePhenomenon {
    let superset = composites.iter().find(|candidate| {
        let ids: HashSet<&str> = candidate.component_ids().collect();
        composites
            .iter()
            .all(|other| other.component_ids().all(|id| ids.contains(id)))
    });
    if let Some(superset) = superset {
        return superset;
    }
    composites
        .iter()
        .min_by(|a, b| {
            b.components
                .len()
                .cmp(&a.components.len())
                .then_with(|| a.id.cmp(&b.id))
        })
        .unwrap_or(&composites[0])
}

/// Composite covering the most referenced singles.
fn covering_composite<'a>(
    composites: &'a [CompositePhenomenon],
    singles: &[SinglePhenomenon],
) -> &'a CompositePhenomenon {
    let covered = |composite: &CompositePhenomenon| {
        singles
            .iter()
            .filter(|single| composite.component_ids().any(|id| id == single.id))
            .count()
    };
    composites
        .iter()
        .min_by(|a, b| {
            covered(b)
                .cmp(&covered(a))
                .then_with(|| b.components.len().cmp(&a.components.len()))
                .then_with(|| a.id.cmp(&b.id))
        })
        .unwrap_or(&composites[0])
}

/// Phenomenon lookups bound to one connection.
pub struct PhenomenonResolver<'a> {
    connection: &'a dyn StoreConnection,
}

impl<'a> PhenomenonResolver<'a> {
    pub fn new(connection: &'a dyn StoreConnection) -> Self {
        Self { connection }
    }

    /// Single or composite phenomenon `id`, `None` when unknown.
    pub async fn resolve_phenomenon(
        &self,
        version: Option<&str>,
        id: &str,
        mut cache: Option<&mut SessionCache>,
    ) -> Result<Option<Phenomenon>> {
        if let Some(hit) = cache.as_deref_mut().and_then(|c| c.phenomenon(version, id)) {
            return Ok(Some(hit));
        }
        let stored = storage_id(version, id);
        let base = self.single(stored).await?;
        let components = self.components(stored).await?;
        let resolved = if components.is_empty() {
            base.map(Phenomenon::Single)
        } else {
            let mut composite = CompositePhenomenon::new(stored, components);
            if let Some(base) = base {
                composite.name = base.name;
                composite.definition = base.definition;
                composite.description = base.description;
            }
            Some(Phenomenon::Composite(composite))
        };
        if let (Some(cache), Some(resolved)) = (cache, &resolved) {
            cache.put_phenomenon(version, id, resolved.clone());
        }
        Ok(resolved)
    }

    /// Phenomenon describing every observation of `procedure`.
    pub async fn resolve_global_composite(
        &self,
        procedure: &str,
        version: Option<&str>,
        mut cache: Option<&mut SessionCache>,
    ) -> Result<Option<Phenomenon>> {
        let mut query = FilterQuery::new(
            "DISTINCT o.\"observed_property\" AS \"phenomenon\"",
            "observations o",
        );
        let p = query.set_param(procedure);
        query.and(&format!("o.\"procedure\" = {p}"));
        query.and("o.\"observed_property\" IS NOT NULL");
        query.seal();
        let query = query.with_order_by(vec!["\"phenomenon\"".to_string()]);

        let mut ids = Vec::new();
        let mut cursor = self.connection.query(&query.fill_params()?).await?;
        while cursor.next().await? {
            if let Some(id) = cursor.get_text("phenomenon")? {
                ids.push(id);
            }
        }
        let mut candidates = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(found) = self
                .resolve_phenomenon(version, id, cache.as_deref_mut())
                .await?
            {
                if !candidates.iter().any(|c: &Phenomenon| c.id() == found.id()) {
                    candidates.push(found);
                }
            }
        }

        match compose(candidates) {
            Composition::Empty => Ok(None),
            Composition::Resolved(phenomenon) => Ok(Some(phenomenon)),
            Composition::NeedsVirtual => {
                let fields = FieldCatalog::new(self.connection)
                    .read_fields(procedure, true, false)
                    .await?;
                debug!(procedure, fields = fields.len(), "synthesizing virtual composite");
                let components = fields
                    .into_iter()
                    .map(|field| SinglePhenomenon {
                        id: field.name.clone(),
                        name: field.label.or(Some(field.name)),
                        definition: field.definition,
                        description: field.description,
                    })
                    .collect();
                Ok(Some(Phenomenon::Composite(CompositePhenomenon::new(
                    format!("{VIRTUAL_COMPOSITE_PREFIX}{procedure}"),
                    components,
                ))))
            }
        }
    }

    async fn single(&self, id: &str) -> Result<Option<SinglePhenomenon>> {
        let mut query = FilterQuery::new(
            "op.\"id\", op.\"name\", op.\"definition\", op.\"description\"",
            "observed_properties op",
        );
        let p = query.set_param(id);
        query.and(&format!("op.\"id\" = {p}"));
        let mut cursor = self.connection.query(&query.fill_params()?).await?;
        if !cursor.next().await? {
            return Ok(None);
        }
        Ok(Some(SinglePhenomenon {
            id: id.to_string(),
            name: cursor.get_text("name")?,
            definition: cursor.get_text("definition")?,
            description: cursor.get_text("description")?,
        }))
    }

    async fn components(&self, id: &str) -> Result<Vec<SinglePhenomenon>> {
        let mut query = FilterQuery::new(
            "c.\"component\" AS \"component\", op.\"name\" AS \"name\", \
             op.\"definition\" AS \"definition\", op.\"description\" AS \"description\"",
            "components c LEFT JOIN observed_properties op ON op.\"id\" = c.\"component\"",
        );
        let p = query.set_param(id);
        query.and(&format!("c.\"phenomenon\" = {p}"));
        let query = query.with_order_by(vec!["c.\"order\"".to_string()]);
        let mut cursor = self.connection.query(&query.fill_params()?).await?;
        let mut out = Vec::new();
        while cursor.next().await? {
            let Some(component) = cursor.get_text("component")? else {
                continue;
            };
            out.push(SinglePhenomenon {
                id: component,
                name: cursor.get_text("name")?,
                definition: cursor.get_text("definition")?,
                description: cursor.get_text("description")?,
            });
        }
        Ok(out)
    }
}
