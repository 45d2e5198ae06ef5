use crate::engine::Engine;
use crate::subsystems::query::{self, DEFAULT_LIMIT};
use rapport_core::ipc::{RapportRequest, RapportResponse};
use rapport_core::Result;
use serde::Serialize;
use serde_json::{json, Value};

pub async fn handle_request(request: RapportRequest, engine: &Engine) -> RapportResponse {
    match dispatch(request, engine).await {
        Ok(data) => RapportResponse::ok(data),
        Err(e) => RapportResponse::err(e.to_string()),
    }
}

/// Run one request against the engine, keeping the typed error for callers
/// that map it onto their own status codes.
pub async fn dispatch(request: RapportRequest, engine: &Engine) -> Result<Value> {
    match request {
        RapportRequest::Ping => Ok(json!({"pong": true})),
        RapportRequest::Health => {
            let version = engine.store().health().await?;
            Ok(json!({
                "postgresql": version,
                "status": "healthy"
            }))
        }
        RapportRequest::UpsertMember { member } => {
            engine.upsert_member(&member).await?;
            Ok(json!({
                "upserted": true,
                "user_id": member.user_id
            }))
        }
        RapportRequest::RecordMessage { message } => to_value(engine.ingest_message(message).await?),
        RapportRequest::RecordReaction { reaction } => {
            let recorded = engine.ingest_reaction(&reaction).await?;
            Ok(json!({ "recorded": recorded }))
        }
        RapportRequest::TopRelationships {
            guild_id,
            user_id,
            limit,
        } => {
            let limit = limit.unwrap_or(DEFAULT_LIMIT);
            let relationships =
                query::top_relationships(engine.store(), &guild_id, &user_id, limit).await?;
            Ok(json!({
                "count": relationships.len(),
                "relationships": relationships,
            }))
        }
        RapportRequest::RelationshipBetween {
            guild_id,
            user_a,
            user_b,
        } => to_value(query::relationship_between(engine.store(), &guild_id, &user_a, &user_b).await?),
        RapportRequest::MutualConnections {
            guild_id,
            user_a,
            user_b,
        } => {
            let mutual = query::mutual_connections(engine.store(), &guild_id, &user_a, &user_b).await?;
            Ok(json!({
                "count": mutual.len(),
                "mutual": mutual,
            }))
        }
        RapportRequest::AnalyzeRelationship {
            guild_id,
            user_a,
            user_b,
        } => {
            let analysis =
                query::analyze_relationship(engine.store(), &guild_id, &user_a, &user_b).await?;
            Ok(json!({
                "found": analysis.is_some(),
                "analysis": analysis,
            }))
        }
        RapportRequest::RelationshipContext {
            guild_id,
            user_id,
            limit,
        } => {
            let limit = limit.unwrap_or(DEFAULT_LIMIT);
            to_value(query::relationship_context(engine.store(), &guild_id, &user_id, limit).await?)
        }
        RapportRequest::Rollup {
            guild_id,
            user_id: Some(user_id),
        } => {
            let network = engine.rollup_member(&guild_id, &user_id).await?;
            Ok(json!({
                "user_id": user_id,
                "neighbors": network.len(),
                "relationships": network,
            }))
        }
        RapportRequest::Rollup {
            guild_id,
            user_id: None,
        } => to_value(engine.rollup_guild(&guild_id).await),
        RapportRequest::Backfill { guild_id } => to_value(engine.backfill_guild(&guild_id).await),
        RapportRequest::Maintain { guild_id } => to_value(engine.maintain(&guild_id).await),
        RapportRequest::PurgeGuild { guild_id } => {
            let removed = engine.purge_guild(&guild_id).await?;
            Ok(json!({
                "purged": true,
                "edges_removed": removed,
            }))
        }
    }
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}
