//! Reducers of the tank module.

use super::procedures::{ProcedureRegistry, ReducerContext, ReducerResult};
use crate::schema::{
    Chassis, ChassisStats, CreateTank, Engine, EngineStats, ReducerKind, SetUserName, Tank,
    Turret, TurretStats, User, CLIENT_CONNECTED, CLIENT_DISCONNECTED, INIT,
};
use tracing::{info, warn};

/// Handlers for every reducer in [`schema::registry`](crate::schema::registry).
pub fn procedures() -> ProcedureRegistry {
    ProcedureRegistry::new()
        .lifecycle(INIT, ReducerKind::Init, init)
        .lifecycle(CLIENT_CONNECTED, ReducerKind::ClientConnected, client_connected)
        .lifecycle(
            CLIENT_DISCONNECTED,
            ReducerKind::ClientDisconnected,
            client_disconnected,
        )
        .reducer::<SetUserName>(set_user_name)
        .reducer::<CreateTank>(create_tank)
}

/// Seed the part catalogue.
fn init(ctx: &mut ReducerContext<'_>) -> ReducerResult {
    for (name, cost, attack_percentage) in [("Light Cannon", 2, 55), ("Heavy Cannon", 5, 80)] {
        ctx.table::<Turret>()
            .insert(Turret::new(name, cost, TurretStats { attack_percentage }))?;
    }
    for (name, cost, armor_points_allowed) in [("Scout Hull", 1, 12), ("Battle Hull", 3, 24)] {
        ctx.table::<Chassis>()
            .insert(Chassis::new(name, cost, ChassisStats { armor_points_allowed }))?;
    }
    for (name, cost, speed) in [("Diesel", 1, 6), ("Turbine", 3, 11)] {
        ctx.table::<Engine>()
            .insert(Engine::new(name, cost, EngineStats { speed }))?;
    }
    info!(target: "tablesync::module", "seeded part catalogue");
    Ok(())
}

/// Find or create the caller's user row, then mark it online.
fn client_connected(ctx: &mut ReducerContext<'_>) -> ReducerResult {
    let sender = ctx.sender;
    let now = ctx.timestamp;

    if let Some(mut user) = ctx.table::<User>().find(&sender) {
        info!(target: "tablesync::module", user = %sender.short(), "user has signed in");
        user.online = true;
        user.last_seen = now;
        ctx.table::<User>().update(user)?;
    } else {
        info!(target: "tablesync::module", user = %sender.short(), "new user has signed in");
        ctx.table::<User>().insert(User {
            identity: sender,
            name: None,
            online: true,
            last_seen: now,
        })?;
    }
    Ok(())
}

fn client_disconnected(ctx: &mut ReducerContext<'_>) -> ReducerResult {
    let sender = ctx.sender;
    let Some(mut user) = ctx.table::<User>().find(&sender) else {
        warn!(target: "tablesync::module", user = %sender.short(), "no user found for disconnected client");
        return Ok(());
    };

    info!(target: "tablesync::module", user = %sender.short(), "user has signed out");
    user.online = false;
    user.last_seen = ctx.timestamp;
    ctx.table::<User>().update(user)?;
    Ok(())
}

/// Rename the caller. A caller without a user row is ignored.
fn set_user_name(ctx: &mut ReducerContext<'_>, args: SetUserName) -> ReducerResult {
    let sender = ctx.sender;
    let Some(mut user) = ctx.table::<User>().find(&sender) else {
        warn!(
            target: "tablesync::module",
            user = %sender.short(),
            name = %args.name,
            "user tried to set their name, but no user record was found"
        );
        return Ok(());
    };

    info!(target: "tablesync::module", user = %sender.short(), name = %args.name, "user changed their name");
    user.name = Some(args.name);
    ctx.table::<User>().update(user)?;
    Ok(())
}

/// Assemble a tank for the caller from existing parts.
fn create_tank(ctx: &mut ReducerContext<'_>, args: CreateTank) -> ReducerResult {
    let owner = ctx.sender;
    let now = ctx.timestamp;
    let chassis = ctx
        .table::<Chassis>()
        .find(&args.chassis_id)
        .ok_or_else(|| format!("no chassis with id {}", args.chassis_id))?;
    let turret = ctx
        .table::<Turret>()
        .find(&args.turret_id)
        .ok_or_else(|| format!("no turret with id {}", args.turret_id))?;
    let engine = ctx
        .table::<Engine>()
        .find(&args.engine_id)
        .ok_or_else(|| format!("no engine with id {}", args.engine_id))?;

    let cost = chassis
        .armor_points_cost
        .checked_add(turret.armor_points_cost)
        .and_then(|c| c.checked_add(engine.armor_points_cost))
        .ok_or_else(|| "part costs overflow".to_string())?;
    let remaining = chassis
        .stats
        .armor_points_allowed
        .checked_sub(cost)
        .ok_or_else(|| format!("armor budget of {} overflows", chassis.name))?;
    if remaining <= 0 {
        return Err(format!(
            "parts cost {} armor points but {} allows only {}",
            cost, chassis.name, chassis.stats.armor_points_allowed
        ));
    }

    let tank = ctx.table::<Tank>().insert(Tank {
        id: 0,
        owning_player: owner,
        chassis_id: chassis.id,
        turret_id: turret.id,
        engine_id: engine.id,
        remaining_armor_points: remaining,
        created: now,
        last_updated: now,
    })?;
    info!(target: "tablesync::module", tank = tank.id, owner = %tank.owning_player.short(), "tank created");
    Ok(())
}
