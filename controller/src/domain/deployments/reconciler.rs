//! Deployment reconciler
//!
//! Activation upserts the module's topics, subscriptions, and subscribers in
//! one transaction; deactivation tears them down. Subscriptions without any
//! subscribing verb are skipped entirely so controllers never grind on
//! subscriptions nobody consumes. A skipped subscription that gains
//! subscribers in a later deployment starts at the topic head; the reset is
//! surfaced as an informational timeline event.

use sqlx::{SqliteConnection, SqlitePool};
use thiserror::Error;

use crate::data::error::DataError;
use crate::data::sqlite::repositories::{deployments, subscriptions, timeline, topics};
use crate::model::keys::{DeploymentKey, KeyError, SubscriberKey, SubscriptionKey};
use crate::model::schema::{ModuleSchema, SchemaError, VerbRef};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("subscription {module}.{name} references unknown topic {topic_module}.{topic_name}")]
    TopicNotFound {
        module: String,
        name: String,
        topic_module: String,
        topic_name: String,
    },

    #[error("subscription {module}.{name} not found")]
    SubscriptionNotFound { module: String, name: String },

    #[error("no events published to topic of subscription {module}.{name}")]
    EmptyTopic { module: String, name: String },

    #[error("deployment not found")]
    DeploymentNotFound,

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Data(DataError),
}

impl From<DataError> for ReconcileError {
    fn from(e: DataError) -> Self {
        Self::Data(e)
    }
}

pub struct Reconciler {
    pool: SqlitePool,
}

impl Reconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Activate a deployment of the module described by `schema`.
    ///
    /// Replaces any previously active deployment of the same module: its
    /// subscriptions are re-owned by the new deployment and whatever it no
    /// longer declares is deleted.
    pub async fn activate(
        &self,
        schema: &ModuleSchema,
        endpoint: Option<&str>,
    ) -> Result<DeploymentKey, ReconcileError> {
        let key = DeploymentKey::new(&schema.name)?;
        let mut tx = self.pool.begin().await.map_err(DataError::from)?;

        deployments::create_deployment(&mut tx, &key, schema, endpoint).await?;
        let replaced = deployments::deactivate_module_except(&mut tx, &schema.name, &key).await?;

        for topic in schema.topics() {
            topics::upsert_topic(&mut tx, &schema.name, topic).await?;
            tracing::debug!(module = schema.name, topic, "Topic upserted");
        }

        self.create_subscriptions(&mut tx, &key, schema).await?;
        self.create_subscribers(&mut tx, &key, schema).await?;

        // The replaced deployment's leftovers: subscribers always belong to
        // the deployment that declared them, and any subscription still
        // owned by the old deployment was dropped from the new schema
        if let Some(replaced) = &replaced {
            let removed =
                subscriptions::delete_subscribers_for_deployment(&mut tx, replaced).await?;
            if !removed.is_empty() {
                tracing::debug!(deployment = replaced, count = removed.len(), "Deleted subscribers");
            }
            let removed =
                subscriptions::delete_subscriptions_for_deployment(&mut tx, replaced).await?;
            if !removed.is_empty() {
                tracing::debug!(deployment = replaced, count = removed.len(), "Deleted subscriptions");
            }
        }

        let event_type = if replaced.is_some() {
            timeline::EventType::DeploymentUpdated
        } else {
            timeline::EventType::DeploymentCreated
        };
        timeline::insert_deployment_event(
            &mut tx,
            event_type,
            &timeline::DeploymentEntry {
                deployment_key: key.to_string(),
                module_name: schema.name.clone(),
                replaced_deployment: replaced,
            },
        )
        .await?;

        tx.commit().await.map_err(DataError::from)?;
        tracing::info!(deployment = %key, module = schema.name, "Deployment activated");
        Ok(key)
    }

    async fn create_subscriptions(
        &self,
        tx: &mut SqliteConnection,
        key: &DeploymentKey,
        schema: &ModuleSchema,
    ) -> Result<(), ReconcileError> {
        for (name, topic_ref) in schema.subscriptions() {
            if !schema.has_subscribers(name) {
                // Ignore subscriptions without subscribers so controllers
                // don't endlessly try to progress them. A subscription whose
                // subscribers are all removed and later re-added resets to
                // the topic's head.
                tracing::debug!(
                    subscription = name,
                    deployment = %key,
                    "Skipping subscription with no subscribers"
                );
                continue;
            }

            let Some(topic) =
                topics::get_topic(&mut *tx, &topic_ref.module, &topic_ref.name).await?
            else {
                return Err(ReconcileError::TopicNotFound {
                    module: schema.name.clone(),
                    name: name.to_string(),
                    topic_module: topic_ref.module.clone(),
                    topic_name: topic_ref.name.clone(),
                });
            };

            let sub_key = SubscriptionKey::new(&schema.name, name)?;
            let (_, inserted) = subscriptions::upsert_subscription(
                &mut *tx,
                &sub_key,
                key.to_string().as_str(),
                topic.id,
            )
            .await?;

            if inserted {
                tracing::debug!(subscription = %sub_key, deployment = %key, "Inserted subscription");
                // Fresh cursor: consumption starts at the topic head,
                // skipping anything published before this point
                timeline::insert_log_event(
                    &mut *tx,
                    &timeline::LogEntry {
                        deployment_key: key.to_string(),
                        request_key: None,
                        level: timeline::LogLevel::Info,
                        message: format!(
                            "subscription {} starts at the head of {}.{}",
                            sub_key, topic_ref.module, topic_ref.name
                        ),
                        attributes: serde_json::Map::new(),
                        error: None,
                    },
                )
                .await?;
            } else {
                tracing::debug!(subscription = %sub_key, deployment = %key, "Updated subscription");
            }
        }
        Ok(())
    }

    async fn create_subscribers(
        &self,
        tx: &mut SqliteConnection,
        key: &DeploymentKey,
        schema: &ModuleSchema,
    ) -> Result<(), ReconcileError> {
        for (name, _) in schema.subscriptions() {
            if !schema.has_subscribers(name) {
                continue;
            }
            let sub = subscriptions::get_subscription(&mut *tx, &schema.name, name).await?;

            for (verb, retry) in schema.subscribers_of(name)? {
                let sink = VerbRef::new(&schema.name, verb);
                if retry.catch.as_ref() == Some(&sink) {
                    return Err(SchemaError::CatchIsSink {
                        verb: sink.to_string(),
                    }
                    .into());
                }

                let subscriber_key = SubscriberKey::new(&schema.name, name, verb)?;
                subscriptions::insert_subscriber(
                    &mut *tx,
                    &subscriber_key,
                    sub.id,
                    key.to_string().as_str(),
                    &sink,
                    retry.count as i64,
                    retry.min_backoff.as_millis() as i64,
                    retry.max_backoff.as_millis() as i64,
                    retry.catch.as_ref(),
                )
                .await?;
                tracing::debug!(subscriber = %subscriber_key, deployment = %key, "Inserted subscriber");
            }
        }
        Ok(())
    }

    /// Deactivate a deployment: remove its subscribers, then its
    /// subscriptions, then mark it inactive.
    pub async fn deactivate(&self, key: &DeploymentKey) -> Result<(), ReconcileError> {
        let mut tx = self.pool.begin().await.map_err(DataError::from)?;

        let deployment = match deployments::get_deployment(&mut tx, key).await {
            Ok(deployment) => deployment,
            Err(DataError::NotFound(_)) => return Err(ReconcileError::DeploymentNotFound),
            Err(e) => return Err(e.into()),
        };

        subscriptions::delete_subscribers_for_deployment(&mut tx, key.to_string().as_str()).await?;
        subscriptions::delete_subscriptions_for_deployment(&mut tx, key.to_string().as_str())
            .await?;
        deployments::deactivate(&mut tx, key).await?;

        timeline::insert_deployment_event(
            &mut tx,
            timeline::EventType::DeploymentUpdated,
            &timeline::DeploymentEntry {
                deployment_key: key.to_string(),
                module_name: deployment.module.clone(),
                replaced_deployment: None,
            },
        )
        .await?;

        tx.commit().await.map_err(DataError::from)?;
        tracing::info!(deployment = %key, module = deployment.module, "Deployment deactivated");
        Ok(())
    }

    /// Reset a subscription's cursor to its topic's head event.
    pub async fn reset_subscription(&self, module: &str, name: &str) -> Result<(), ReconcileError> {
        let mut tx = self.pool.begin().await.map_err(DataError::from)?;

        let sub = match subscriptions::get_subscription(&mut tx, module, name).await {
            Ok(sub) => sub,
            Err(DataError::NotFound(_)) => {
                return Err(ReconcileError::SubscriptionNotFound {
                    module: module.to_string(),
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let Some(head) = topics::topic_head(&mut tx, sub.topic_id).await? else {
            return Err(ReconcileError::EmptyTopic {
                module: module.to_string(),
                name: name.to_string(),
            });
        };
        subscriptions::set_cursor(&mut tx, sub.id, head).await?;

        tx.commit().await.map_err(DataError::from)?;
        tracing::info!(subscription = %sub.key, head, "Subscription reset to topic head");
        Ok(())
    }
}
