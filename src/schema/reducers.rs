//! Reducer argument types of the tank module.

use super::ReducerArgs;
use serde::{Deserialize, Serialize};

/// Host-invoked once when the module is created.
pub const INIT: &str = "init";

/// Host-invoked when a client connects.
pub const CLIENT_CONNECTED: &str = "client_connected";

/// Host-invoked when a client disconnects.
pub const CLIENT_DISCONNECTED: &str = "client_disconnected";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUserName {
    pub name: String,
}

impl ReducerArgs for SetUserName {
    const NAME: &'static str = "set_user_name";
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTank {
    pub chassis_id: u32,
    pub turret_id: u32,
    pub engine_id: u32,
}

impl ReducerArgs for CreateTank {
    const NAME: &'static str = "create_tank";
}
