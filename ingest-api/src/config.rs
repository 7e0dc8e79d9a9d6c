use envconfig::Envconfig;

use ingest_common::broker::Topology;
use ingest_common::config::{NonEmptyString, NonZeroCount, QueryLimit};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "DATABASE_URL")]
    pub database_url: String,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "100")]
    pub query_limit: QueryLimit,

    #[envconfig(default = "500")]
    pub insert_batch_size: NonZeroCount,

    #[envconfig(default = "data/applicant_data.json")]
    pub data_file: String,

    /// Rows taken from the scraper output per pull. Zero takes every row.
    #[envconfig(default = "200")]
    pub pull_target_rows: usize,

    #[envconfig(nested = true)]
    pub broker: BrokerConfig,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn target_rows(&self) -> Option<usize> {
        match self.pull_target_rows {
            0 => None,
            n => Some(n),
        }
    }
}

#[derive(Envconfig, Clone)]
pub struct BrokerConfig {
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
}

impl BrokerConfig {
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
