use chrono::Utc;
use diesel::prelude::*;

use beamcast_shared::clients::db::DbPool;
use beamcast_shared::errors::{AppError, AppResult};

use super::stream_store::StatusChange;
use super::StreamStore;
use crate::models::{NewStream, NewStreamJoiner, Stream, StreamJoiner, StreamStatus, StreamWithJoiners};
use crate::schema::{stream_joiners, streams};

pub struct PgStreamStore {
    pool: DbPool,
}

impl PgStreamStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(
        &self,
    ) -> AppResult<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<PgConnection>>> {
        self.pool.get().map_err(|e| AppError::internal(e.to_string()))
    }
}

impl StreamStore for PgStreamStore {
    fn list_streams(&self) -> AppResult<Vec<StreamWithJoiners>> {
        let mut conn = self.conn()?;

        let all_streams = streams::table
            .order(streams::id.asc())
            .select(Stream::as_select())
            .load::<Stream>(&mut conn)?;

        let joiners = StreamJoiner::belonging_to(&all_streams)
            .order(stream_joiners::id.asc())
            .select(StreamJoiner::as_select())
            .load::<StreamJoiner>(&mut conn)?;

        Ok(joiners
            .grouped_by(&all_streams)
            .into_iter()
            .zip(all_streams)
            .map(|(joiners, stream)| StreamWithJoiners { stream, joiners })
            .collect())
    }

    fn find_stream(&self, id: i32) -> AppResult<Option<Stream>> {
        let mut conn = self.conn()?;
        let stream = streams::table
            .find(id)
            .select(Stream::as_select())
            .first::<Stream>(&mut conn)
            .optional()?;
        Ok(stream)
    }

    fn create_stream(&self, new: NewStream) -> AppResult<Stream> {
        let mut conn = self.conn()?;
        let stream = diesel::insert_into(streams::table)
            .values(&new)
            .returning(Stream::as_returning())
            .get_result::<Stream>(&mut conn)?;

        tracing::info!(stream_id = stream.id, title = %stream.title, "stream created");
        Ok(stream)
    }

    fn set_status(&self, id: i32, status: StreamStatus) -> AppResult<Option<StatusChange>> {
        let mut conn = self.conn()?;

        conn.transaction::<_, AppError, _>(|conn| {
            // row lock holds off concurrent updates until commit
            let Some(current) = streams::table
                .find(id)
                .select(streams::status)
                .for_update()
                .first::<String>(conn)
                .optional()?
            else {
                return Ok(None);
            };

            let from = StreamStatus::parse(&current)?;
            StreamStatus::ensure_transition(from, status)?;

            let stream = diesel::update(streams::table.find(id))
                .set((
                    streams::status.eq(status.as_str()),
                    streams::updated_at.eq(Utc::now()),
                ))
                .returning(Stream::as_returning())
                .get_result::<Stream>(conn)?;
            Ok(Some(StatusChange { from, stream }))
        })
    }

    fn add_joiner(&self, new: NewStreamJoiner) -> AppResult<Option<StreamJoiner>> {
        let mut conn = self.conn()?;

        conn.transaction::<_, AppError, _>(|conn| {
            let exists = streams::table
                .find(new.stream_id)
                .select(streams::id)
                .first::<i32>(conn)
                .optional()?
                .is_some();
            if !exists {
                return Ok(None);
            }

            let joiner = diesel::insert_into(stream_joiners::table)
                .values(&new)
                .returning(StreamJoiner::as_returning())
                .get_result::<StreamJoiner>(conn)?;
            Ok(Some(joiner))
        })
    }

    fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn()?;
        diesel::sql_query("SELECT 1").execute(&mut conn)?;
        Ok(())
    }
}
