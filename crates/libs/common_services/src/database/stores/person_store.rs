use crate::clustering::{ClusterError, ClusterStore, Redirect, StoredClusters};
use crate::database::tables::{PersonMemberRow, PersonRow, RedirectRow};
use async_trait::async_trait;
use common_types::{FaceRef, OwnerId, PersonCluster};
use pgvector::Vector;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeSet, HashMap};

/// Person clusters in the `person` and `person_member` tables, with
/// centroids stored as pgvector values.
///
/// Every write names the version it expects, so engines in different
/// processes cannot overwrite each other's clusters.
#[derive(Clone)]
pub struct PgClusterStore {
    pool: PgPool,
}

impl PgClusterStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Live clusters and redirects, of one owner or of everyone.
    async fn load_scoped(&self, owner_id: Option<OwnerId>) -> Result<StoredClusters, ClusterError> {
        let people = sqlx::query_as::<_, PersonRow>(
            "SELECT person_id, owner_id, centroid, member_count, version
             FROM person
             WHERE merged_into IS NULL AND ($1::int IS NULL OR owner_id = $1)
             ORDER BY person_id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let members = sqlx::query_as::<_, PersonMemberRow>(
            "SELECT m.photo_id, m.face_index, m.person_id
             FROM person_member m
             JOIN person p ON p.person_id = m.person_id
             WHERE $1::int IS NULL OR p.owner_id = $1",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        let mut refs: HashMap<String, BTreeSet<FaceRef>> = HashMap::new();
        for member in members {
            refs.entry(member.person_id)
                .or_default()
                .insert(FaceRef::new(member.photo_id, member.face_index));
        }

        let clusters = people
            .into_iter()
            .map(|row| {
                let member_refs = refs.remove(&row.person_id).unwrap_or_default();
                PersonCluster {
                    person_id: row.person_id,
                    owner_id: row.owner_id,
                    centroid: row.centroid.to_vec(),
                    member_count: row.member_count,
                    member_refs,
                    version: row.version,
                }
            })
            .collect();

        let redirects = sqlx::query_as::<_, RedirectRow>(
            "SELECT person_id, owner_id, merged_into
             FROM person
             WHERE merged_into IS NOT NULL AND ($1::int IS NULL OR owner_id = $1)",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Redirect {
            owner_id: row.owner_id,
            person_id: row.person_id,
            merged_into: row.merged_into,
        })
        .collect();

        Ok(StoredClusters {
            clusters,
            redirects,
        })
    }

    /// Updates a live person if it is still at `expected_version`.
    async fn update_person(
        tx: &mut Transaction<'_, Postgres>,
        cluster: &PersonCluster,
        expected_version: i64,
    ) -> Result<(), ClusterError> {
        let result = sqlx::query(
            r"
            UPDATE person
            SET centroid = $2, member_count = $3, version = $4, updated_at = now()
            WHERE person_id = $1 AND version = $5 AND merged_into IS NULL
            ",
        )
        .bind(&cluster.person_id)
        .bind(Vector::from(cluster.centroid.clone()))
        .bind(cluster.member_count)
        .bind(cluster.version)
        .bind(expected_version)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ClusterError::Stale(cluster.person_id.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for PgClusterStore {
    async fn load(&self) -> Result<StoredClusters, ClusterError> {
        self.load_scoped(None).await
    }

    async fn load_owner(&self, owner_id: OwnerId) -> Result<StoredClusters, ClusterError> {
        self.load_scoped(Some(owner_id)).await
    }

    async fn record_assignment(
        &self,
        cluster: &PersonCluster,
        member: &FaceRef,
        expected_version: Option<i64>,
    ) -> Result<(), ClusterError> {
        let mut tx = self.pool.begin().await?;
        match expected_version {
            Some(expected) => Self::update_person(&mut tx, cluster, expected).await?,
            None => {
                let result = sqlx::query(
                    r"
                    INSERT INTO person (person_id, owner_id, centroid, member_count, version)
                    VALUES ($1, $2, $3, $4, $5)
                    ON CONFLICT (person_id) DO NOTHING
                    ",
                )
                .bind(&cluster.person_id)
                .bind(cluster.owner_id)
                .bind(Vector::from(cluster.centroid.clone()))
                .bind(cluster.member_count)
                .bind(cluster.version)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() == 0 {
                    return Err(ClusterError::Stale(cluster.person_id.clone()));
                }
            }
        }
        sqlx::query(
            r"
            INSERT INTO person_member (photo_id, face_index, person_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (photo_id, face_index) DO UPDATE SET person_id = EXCLUDED.person_id
            ",
        )
        .bind(&member.photo_id)
        .bind(member.face_index)
        .bind(&cluster.person_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_merge(
        &self,
        survivor: &PersonCluster,
        survivor_version: i64,
        absorbed: &PersonCluster,
    ) -> Result<(), ClusterError> {
        let mut tx = self.pool.begin().await?;
        Self::update_person(&mut tx, survivor, survivor_version).await?;

        let result = sqlx::query(
            "UPDATE person SET merged_into = $1, member_count = 0, updated_at = now()
             WHERE person_id = $2 AND version = $3 AND merged_into IS NULL",
        )
        .bind(&survivor.person_id)
        .bind(&absorbed.person_id)
        .bind(absorbed.version)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ClusterError::Stale(absorbed.person_id.clone()));
        }

        sqlx::query("UPDATE person_member SET person_id = $1 WHERE person_id = $2")
            .bind(&survivor.person_id)
            .bind(&absorbed.person_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE person SET merged_into = $1 WHERE merged_into = $2")
            .bind(&survivor.person_id)
            .bind(&absorbed.person_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
