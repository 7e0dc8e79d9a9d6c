use envconfig::Envconfig;
use uuid::Uuid;

use ingest_common::broker::Topology;
use ingest_common::config::{EnvMsDuration, NonEmptyString, NonZeroCount};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(default = "4")]
    pub max_pg_connections: u32,

    #[envconfig(from = "BROKER_EXCHANGE", default = "applicant.events")]
    pub exchange: NonEmptyString,

    #[envconfig(from = "BROKER_QUEUE", default = "applicant.ingest")]
    pub queue: NonEmptyString,

    #[envconfig(from = "BROKER_ROUTING_KEY", default = "applicant.created")]
    pub routing_key: NonEmptyString,

    #[envconfig(from = "BROKER_TASK_EXCHANGE", default = "tasks")]
    pub task_exchange: NonEmptyString,

    #[envconfig(from = "BROKER_TASK_QUEUE", default = "tasks_q")]
    pub task_queue: NonEmptyString,

    #[envconfig(from = "BROKER_TASK_ROUTING_KEY", default = "tasks")]
    pub task_routing_key: NonEmptyString,

    /// Scraper output ingested by `scrape_new_data` tasks that name no rows or file.
    #[envconfig(default = "data/applicant_data.json")]
    pub data_file: String,

    /// Identifies this process's deliveries. Empty picks a tag unique to this process.
    #[envconfig(default = "")]
    pub consumer_tag: String,

    /// Unacknowledged deliveries this consumer may hold at once.
    #[envconfig(default = "1")]
    pub prefetch: NonZeroCount,

    #[envconfig(default = "100")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub reconnect_delay: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn topology(&self) -> Topology {
        Topology {
            exchange: self.exchange.as_str().to_owned(),
            queue: self.queue.as_str().to_owned(),
            routing_key: self.routing_key.as_str().to_owned(),
        }
    }

    pub fn task_topology(&self) -> Topology {
        Topology {
            exchange: self.task_exchange.as_str().to_owned(),
            queue: self.task_queue.as_str().to_owned(),
            routing_key: self.task_routing_key.as_str().to_owned(),
        }
    }
}

/// Use the configured consumer tag, or make one from the host name and a fresh UUID.
///
/// Recovery hands back every unacknowledged delivery held under a tag, so two replicas
/// sharing one tag would requeue each other's in-flight work.
pub fn resolve_consumer_tag(configured: &str) -> String {
    let configured = configured.trim();
    if !configured.is_empty() {
        return configured.to_owned();
    }

    let hostname = std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_owned());
    format!("{}-{}", hostname, Uuid::now_v7())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_consumer_tag_is_kept() {
        assert_eq!(resolve_consumer_tag("worker-a"), "worker-a");
        assert_eq!(resolve_consumer_tag(" worker-a "), "worker-a");
    }

    #[test]
    fn test_default_consumer_tags_are_unique() {
        let first = resolve_consumer_tag("");
        let second = resolve_consumer_tag("  ");

        assert_ne!(first, second);
        assert!(!first.is_empty());
        let (_, uuid) = first.split_at(first.len() - 36);
        assert!(Uuid::parse_str(uuid).is_ok());
    }
}
