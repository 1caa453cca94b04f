//! Event publisher
//!
//! Accepts a publish from a verb executing on a runner, seals the payload,
//! captures the caller's request key and trace context, and appends to the
//! topic journal. The returned key is final only once the append transaction
//! commits.

use std::sync::Arc;

use sqlx::SqlitePool;
use thiserror::Error;

use crate::data::error::DataError;
use crate::data::sqlite::repositories::topics;
use crate::domain::encryption::{CodecError, KeySpace, PayloadCodec};
use crate::domain::observability;
use crate::model::context::RequestContext;
use crate::model::keys::TopicEventKey;

#[derive(Error, Debug)]
pub enum PublishError {
    /// Publishes must be correlated to an originating request
    #[error("no request context on publish")]
    NoRequestContext,

    #[error("unknown topic {module}.{topic}")]
    TopicNotFound { module: String, topic: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Data(DataError),
}

impl From<DataError> for PublishError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

pub struct Publisher {
    pool: SqlitePool,
    codec: Arc<dyn PayloadCodec>,
}

impl Publisher {
    pub fn new(pool: SqlitePool, codec: Arc<dyn PayloadCodec>) -> Self {
        Self { pool, codec }
    }

    /// Publish an event to `module.topic` on behalf of `caller`.
    pub async fn publish(
        &self,
        module: &str,
        topic: &str,
        caller: &str,
        payload: &[u8],
        ctx: &RequestContext,
    ) -> Result<TopicEventKey, PublishError> {
        let result = self.publish_inner(module, topic, caller, payload, ctx).await;
        observability::published(module, topic, caller, result.is_ok());
        result
    }

    async fn publish_inner(
        &self,
        module: &str,
        topic: &str,
        caller: &str,
        payload: &[u8],
        ctx: &RequestContext,
    ) -> Result<TopicEventKey, PublishError> {
        // The request key the subscriber call will eventually be parented to
        let Some(request_key) = &ctx.request_key else {
            return Err(PublishError::NoRequestContext);
        };
        let trace_json = ctx.trace.as_ref().map(|t| t.to_json());

        let sealed = self.codec.encrypt(KeySpace::Async, payload)?;

        let mut tx = self.pool.begin().await.map_err(DataError::from)?;
        let (_, key) = topics::append_event(
            &mut tx,
            module,
            topic,
            caller,
            &sealed,
            Some(request_key.to_string().as_str()),
            trace_json.as_deref(),
        )
        .await
        .map_err(|e| match e {
            DataError::NotFound(_) => PublishError::TopicNotFound {
                module: module.to_string(),
                topic: topic.to_string(),
            },
            other => PublishError::Data(other),
        })?;
        tx.commit().await.map_err(DataError::from)?;

        Ok(key)
    }
}
