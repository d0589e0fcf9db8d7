//! 复杂度判定：客户端抽象、JSON 提取、适配层、规则判定器与脚本化客户端

pub mod adapter;
pub mod client;
pub mod mock;
pub mod parse;
pub mod rule_based;
pub mod schema;

pub use adapter::{ComplexityOracle, OracleAdapter};
pub use client::{OracleClient, OracleError};
pub use mock::ScriptedOracleClient;
pub use parse::{extract_json_block, parse_block};
pub use rule_based::{RuleBasedOracle, TaskType};
pub use schema::{ComplexityReply, DecompositionReply, RegenerationReply};
