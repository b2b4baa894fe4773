//! Find-or-create of the source → unit → sub-unit and label identities.
//!
//! Every lookup inserts with `ON CONFLICT` and then reads back by natural key, so two
//! writers racing on the same name end up with the same id.

use ratiowatch_core::{
    IdentityTuple, LabelId, Observation, SourceId, SubUnitId, UnitId, UNCATEGORIZED,
};
use sqlx::SqliteConnection;

use crate::StoreError;

pub struct EntityResolver<'c> {
    conn: &'c mut SqliteConnection,
}

impl<'c> EntityResolver<'c> {
    pub fn new(conn: &'c mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Sources are registered from configuration, never created here.
    pub async fn source_id(&mut self, code: &str) -> Result<SourceId, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM sources WHERE code = ?")
            .bind(code)
            .fetch_optional(&mut *self.conn)
            .await?
            .map(SourceId)
            .ok_or_else(|| StoreError::UnknownSource(code.to_string()))
    }

    pub async fn unit_id(&mut self, source: SourceId, name: &str) -> Result<UnitId, StoreError> {
        sqlx::query("INSERT INTO units (source_id, name) VALUES (?, ?) ON CONFLICT (source_id, name) DO NOTHING")
            .bind(source.0)
            .bind(name)
            .execute(&mut *self.conn)
            .await?;
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM units WHERE source_id = ? AND name = ?")
            .bind(source.0)
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(UnitId(id))
    }

    /// `is_target` only ever goes from false to true: a later target sighting promotes a
    /// sub-unit first seen through a combined-intake row.
    pub async fn sub_unit_id(
        &mut self,
        unit: UnitId,
        name: &str,
        is_target: bool,
    ) -> Result<SubUnitId, StoreError> {
        sqlx::query(
            "INSERT INTO sub_units (unit_id, name, is_target) VALUES (?, ?, ?) \
             ON CONFLICT (unit_id, name) DO UPDATE SET is_target = MAX(sub_units.is_target, excluded.is_target)",
        )
        .bind(unit.0)
        .bind(name)
        .bind(is_target)
        .execute(&mut *self.conn)
        .await?;
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM sub_units WHERE unit_id = ? AND name = ?")
            .bind(unit.0)
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(SubUnitId(id))
    }

    /// Labels not seeded from the rules file are created under `category`.
    pub async fn label_id(&mut self, name: &str, category: &str) -> Result<LabelId, StoreError> {
        sqlx::query("INSERT INTO labels (name, category) VALUES (?, ?) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .bind(category)
            .execute(&mut *self.conn)
            .await?;
        let id = sqlx::query_scalar::<_, i64>("SELECT id FROM labels WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *self.conn)
            .await?;
        Ok(LabelId(id))
    }

    pub async fn resolve(&mut self, observation: &Observation) -> Result<IdentityTuple, StoreError> {
        let source = self.source_id(&observation.source_code).await?;
        let unit = self.unit_id(source, &observation.unit_name).await?;
        let sub_unit = self
            .sub_unit_id(unit, &observation.sub_unit_name, observation.is_target)
            .await?;
        let label = self.label_id(&observation.label, UNCATEGORIZED).await?;
        Ok(IdentityTuple {
            source,
            unit,
            sub_unit,
            label,
        })
    }
}
