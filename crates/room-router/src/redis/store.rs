//! Redis-backed node registry and room directory.
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so each operation clones the connection instead of sharing
//! one behind a lock. Node records are JSON values; liveness is judged by
//! the `updated_at` field, never by key TTLs, so a reader and the evictor
//! apply the same rule.

use crate::errors::RouterError;
use crate::redis::{keys, lua_scripts};
use crate::store::{NodeRegistry, RoomDirectory};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use router_proto::internal::Node;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Registry + directory over the shared Redis fabric.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    expire_after: Duration,
    operation_timeout: Duration,
    assign_room_script: Script,
}

impl RedisStore {
    pub(crate) fn new(
        connection: MultiplexedConnection,
        expire_after: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            expire_after,
            operation_timeout,
            assign_room_script: Script::new(lua_scripts::ASSIGN_ROOM_NODE),
        }
    }

    /// Bound a store call by the configured operation deadline.
    async fn bounded<T, F>(&self, operation: F) -> Result<T, RouterError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(RouterError::Canceled(
                "store deadline exceeded".to_string(),
            )),
        }
    }

    fn decode_node(node_id: &str, json: &str) -> Result<Node, RouterError> {
        serde_json::from_str(json).map_err(|err| {
            warn!(
                target: "router.redis.store",
                node_id = %node_id,
                error = %err,
                "failed to deserialize node record"
            );
            RouterError::Protocol(format!("malformed node record for {node_id}: {err}"))
        })
    }
}

#[async_trait]
impl NodeRegistry for RedisStore {
    #[instrument(skip_all, fields(node_id = %node.id))]
    async fn register_node(&self, node: Node) -> Result<(), RouterError> {
        let json = serde_json::to_string(&node).map_err(|err| {
            RouterError::Protocol(format!("failed to serialize node record: {err}"))
        })?;

        let mut conn = self.connection.clone();
        let key = keys::node_key(&node.id);
        let _: () = self
            .bounded(async {
                redis::pipe()
                    .atomic()
                    .set(&key, &json)
                    .sadd(keys::NODES_SET_KEY, &node.id)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        debug!(target: "router.redis.store", node_id = %node.id, "node record written");
        Ok(())
    }

    #[instrument(skip_all, fields(node_id = %node_id))]
    async fn unregister_node(&self, node_id: &str) -> Result<(), RouterError> {
        let mut conn = self.connection.clone();
        let key = keys::node_key(node_id);
        let _: () = self
            .bounded(async {
                redis::pipe()
                    .atomic()
                    .del(&key)
                    .srem(keys::NODES_SET_KEY, node_id)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        debug!(target: "router.redis.store", node_id = %node_id, "node record removed");
        Ok(())
    }

    #[instrument(skip_all, fields(node_id = %node_id))]
    async fn get_node(&self, node_id: &str) -> Result<Node, RouterError> {
        let mut conn = self.connection.clone();
        let key = keys::node_key(node_id);
        let json: Option<String> = self.bounded(conn.get(&key)).await?;

        match json {
            Some(json) => Self::decode_node(node_id, &json),
            None => Err(RouterError::NotFound(format!("node {node_id}"))),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, RouterError> {
        let mut conn = self.connection.clone();
        let node_ids: Vec<String> = self.bounded(conn.smembers(keys::NODES_SET_KEY)).await?;

        let mut nodes = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            let mut conn = self.connection.clone();
            let key = keys::node_key(&node_id);
            let json: Option<String> = self.bounded(conn.get(&key)).await?;
            match json {
                Some(json) => match Self::decode_node(&node_id, &json) {
                    Ok(node) => nodes.push(node),
                    // Skip the malformed record; the evictor reclaims it.
                    Err(_) => continue,
                },
                // Record already expired out from under the set entry.
                None => continue,
            }
        }
        Ok(nodes)
    }

    async fn remove_dead_nodes(&self) -> Result<usize, RouterError> {
        let expire = i64::try_from(self.expire_after.as_secs()).unwrap_or(i64::MAX);
        let now = chrono::Utc::now().timestamp();

        let mut conn = self.connection.clone();
        let node_ids: Vec<String> = self.bounded(conn.smembers(keys::NODES_SET_KEY)).await?;

        let mut removed = 0;
        for node_id in node_ids {
            let mut conn = self.connection.clone();
            let key = keys::node_key(&node_id);
            let json: Option<String> = self.bounded(conn.get(&key)).await?;

            let dead = match json {
                Some(json) => match Self::decode_node(&node_id, &json) {
                    Ok(node) => node
                        .stats
                        .as_ref()
                        .is_none_or(|stats| now - stats.updated_at > expire),
                    // Unreadable records are reclaimed like dead ones.
                    Err(_) => true,
                },
                // Dangling set entry with no record.
                None => true,
            };

            if dead {
                let mut conn = self.connection.clone();
                let _: () = self
                    .bounded(async {
                        redis::pipe()
                            .atomic()
                            .del(&key)
                            .srem(keys::NODES_SET_KEY, &node_id)
                            .query_async(&mut conn)
                            .await
                    })
                    .await?;
                debug!(target: "router.redis.store", node_id = %node_id, "evicted dead node");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl RoomDirectory for RedisStore {
    #[instrument(skip_all, fields(room_name = %room_name))]
    async fn get_node_for_room(&self, room_name: &str) -> Result<String, RouterError> {
        let mut conn = self.connection.clone();
        let key = keys::room_node_key(room_name);
        let node_id: Option<String> = self.bounded(conn.get(&key)).await?;

        node_id.ok_or_else(|| RouterError::NotFound(format!("room {room_name}")))
    }

    #[instrument(skip_all, fields(room_name = %room_name, node_id = %node_id))]
    async fn set_node_for_room(
        &self,
        room_name: &str,
        node_id: &str,
    ) -> Result<String, RouterError> {
        let mut conn = self.connection.clone();
        let key = keys::room_node_key(room_name);
        let mut invocation = self.assign_room_script.key(&key);
        let invocation = invocation.arg(node_id);
        let bound: String = self.bounded(invocation.invoke_async(&mut conn)).await?;

        if bound != node_id {
            debug!(
                target: "router.redis.store",
                room_name = %room_name,
                winner = %bound,
                "lost room assignment race"
            );
        }
        Ok(bound)
    }

    #[instrument(skip_all, fields(room_name = %room_name))]
    async fn clear_room_state(&self, room_name: &str) -> Result<(), RouterError> {
        let mut conn = self.connection.clone();
        let key = keys::room_node_key(room_name);
        let _: () = self.bounded(conn.del(&key)).await?;
        Ok(())
    }
}
