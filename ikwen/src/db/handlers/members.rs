//! Database repository for members.

use std::collections::HashMap;

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::{ListQuery, Repository},
    models::members::{MemberCreateDBRequest, MemberDBResponse, MemberUpdateDBRequest},
};
use crate::types::{MemberId, ServiceId, abbrev_uuid};
use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;
use uuid::Uuid;

/// Filter for listing members
#[derive(Debug, Clone, Default)]
pub struct MemberFilter {
    /// Restrict to the community of a service (members of any of its groups)
    pub service_id: Option<ServiceId>,
    pub query: ListQuery,
}

impl MemberFilter {
    pub fn community(service_id: ServiceId, query: ListQuery) -> Self {
        Self {
            service_id: Some(service_id),
            query,
        }
    }
}

pub struct Members<'c> {
    db: &'c mut PgConnection,
}

const MEMBER_COLUMNS: &str = "m.id, m.username, m.email, m.phone, m.first_name, m.last_name, m.full_name, m.gender, m.dob, \
     m.language, m.password_hash, m.is_ghost, m.is_iao, m.is_staff, m.is_superuser, m.is_active, m.email_verified, \
     m.phone_verified, m.date_joined, m.last_login";

fn push_filter<'a>(builder: &mut QueryBuilder<'a, Postgres>, filter: &'a MemberFilter) {
    builder.push(" WHERE NOT m.is_ghost");
    if let Some(service_id) = filter.service_id {
        builder.push(
            " AND EXISTS (SELECT 1 FROM group_members gm JOIN groups g ON g.id = gm.group_id \
             WHERE gm.member_id = m.id AND g.service_id = ",
        );
        builder.push_bind(service_id);
        builder.push(")");
    }
    if let Some(pattern) = filter.query.search_pattern() {
        builder.push(" AND (LOWER(m.full_name) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR LOWER(m.username) LIKE ");
        builder.push_bind(pattern.clone());
        builder.push(" OR LOWER(COALESCE(m.email, '')) LIKE ");
        builder.push_bind(pattern);
        builder.push(")");
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Members<'c> {
    type CreateRequest = MemberCreateDBRequest;
    type UpdateRequest = MemberUpdateDBRequest;
    type Response = MemberDBResponse;
    type Id = MemberId;
    type Filter = MemberFilter;

    #[instrument(skip(self, request), fields(username = %request.username), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!(
            r#"
            INSERT INTO members AS m (id, username, email, phone, first_name, last_name, full_name, gender, dob, language,
                password_hash, is_ghost, is_iao, is_staff, is_superuser)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, COALESCE($10, 'en'), $11, $12, $13, $14, $15)
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&request.username)
        .bind(&request.email)
        .bind(&request.phone)
        .bind(&request.first_name)
        .bind(&request.last_name)
        .bind(&request.full_name)
        .bind(&request.gender)
        .bind(request.dob)
        .bind(&request.language)
        .bind(&request.password_hash)
        .bind(request.is_ghost)
        .bind(request.is_iao)
        .bind(request.is_staff)
        .bind(request.is_superuser)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(member)
    }

    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!("SELECT {MEMBER_COLUMNS} FROM members m WHERE m.id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        Ok(member)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<MemberId>) -> Result<HashMap<Self::Id, MemberDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let members = sqlx::query_as::<_, MemberDBResponse>(&format!("SELECT {MEMBER_COLUMNS} FROM members m WHERE m.id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(members.into_iter().map(|m| (m.id, m)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.query.limit, skip = filter.query.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {MEMBER_COLUMNS} FROM members m"));
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY m.date_joined DESC LIMIT ");
        builder.push_bind(filter.query.limit);
        builder.push(" OFFSET ");
        builder.push_bind(filter.query.skip);

        let members = builder.build_query_as::<MemberDBResponse>().fetch_all(&mut *self.db).await?;
        Ok(members)
    }

    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM members WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(member_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!(
            r#"
            UPDATE members AS m SET
                username = COALESCE($2, username),
                email = COALESCE($3, email),
                phone = COALESCE($4, phone),
                first_name = COALESCE($5, first_name),
                last_name = COALESCE($6, last_name),
                full_name = COALESCE($7, full_name),
                gender = COALESCE($8, gender),
                dob = COALESCE($9, dob),
                language = COALESCE($10, language),
                password_hash = COALESCE($11, password_hash),
                is_ghost = COALESCE($12, is_ghost),
                is_iao = COALESCE($13, is_iao),
                is_staff = COALESCE($14, is_staff),
                is_active = COALESCE($15, is_active)
            WHERE id = $1
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.username)
        .bind(&request.email)
        .bind(&request.phone)
        .bind(&request.first_name)
        .bind(&request.last_name)
        .bind(&request.full_name)
        .bind(&request.gender)
        .bind(request.dob)
        .bind(&request.language)
        .bind(&request.password_hash)
        .bind(request.is_ghost)
        .bind(request.is_iao)
        .bind(request.is_staff)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;

        Ok(member)
    }
}

impl<'c> Members<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Count members matching a filter, ignoring pagination
    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &MemberFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM members m");
        push_filter(&mut builder, filter);
        let count: i64 = builder.build_query_scalar().fetch_one(&mut *self.db).await?;
        Ok(count)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_username(&mut self, username: &str) -> Result<Option<MemberDBResponse>> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!("SELECT {MEMBER_COLUMNS} FROM members m WHERE m.username = $1"))
            .bind(username)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(member)
    }

    /// Email lookups prefer real accounts over ghosts when several rows share an address.
    #[instrument(skip(self, email), err)]
    pub async fn get_by_email(&mut self, email: &str) -> Result<Option<MemberDBResponse>> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members m WHERE LOWER(m.email) = LOWER($1) ORDER BY m.is_ghost ASC, m.date_joined ASC LIMIT 1"
        ))
        .bind(email)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(member)
    }

    #[instrument(skip(self, phone), err)]
    pub async fn get_by_phone(&mut self, phone: &str) -> Result<Option<MemberDBResponse>> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members m WHERE m.phone = $1 ORDER BY m.is_ghost ASC, m.date_joined ASC LIMIT 1"
        ))
        .bind(phone)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(member)
    }

    /// Find a ghost member matching either the username or the phone.
    #[instrument(skip(self, phone), err)]
    pub async fn find_ghost(&mut self, username: &str, phone: Option<&str>) -> Result<Option<MemberDBResponse>> {
        let member = sqlx::query_as::<_, MemberDBResponse>(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members m WHERE m.is_ghost AND (m.username = $1 OR ($2::text IS NOT NULL AND m.phone = $2)) \
             ORDER BY m.date_joined ASC LIMIT 1"
        ))
        .bind(username)
        .bind(phone)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(member)
    }

    #[instrument(skip(self), fields(member_id = %abbrev_uuid(&id)), err)]
    pub async fn touch_last_login(&mut self, id: MemberId) -> Result<()> {
        sqlx::query("UPDATE members SET last_login = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Members who joined after `since` and carry at least one of the tags, with an email.
    #[instrument(skip(self, tag_ids), fields(tags = tag_ids.len()), err)]
    pub async fn list_tagged(
        &mut self,
        tag_ids: &[Uuid],
        joined_after: Option<chrono::DateTime<chrono::Utc>>,
        skip: i64,
        limit: i64,
    ) -> Result<Vec<MemberDBResponse>> {
        let members = sqlx::query_as::<_, MemberDBResponse>(&format!(
            r#"
            SELECT {MEMBER_COLUMNS} FROM members m
            WHERE m.is_active AND m.email IS NOT NULL
              AND ($2::timestamptz IS NULL OR m.date_joined > $2)
              AND EXISTS (SELECT 1 FROM member_profiles mp WHERE mp.member_id = m.id AND mp.tag_id = ANY($1))
            ORDER BY m.date_joined ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(tag_ids)
        .bind(joined_after)
        .bind(limit)
        .bind(skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(members)
    }
}
