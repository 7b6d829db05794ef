//! Nexthop fan-out
//!
//! When a port's gateway moves, every object routed through it moves with
//! it before the port's own update returns. Each dependent is updated and
//! persisted on its own; one failing route does not stop the others.
//!
//! The caller holds the port's key lock. Every dependent is reloaded and
//! saved under its own key lock, so a concurrent API edit of the same subnet
//! or static is never overwritten with a stale record. The same holds for the
//! `general` and `dns` singletons. None of those operations take a port
//! lock, so the nesting cannot deadlock.

use tracing::{info, warn};

use super::{Kind, PortConf, ReconcileContext, StaticConf, SubnetConf, dns, general, id_contains};
use crate::Result;
use crate::net::vtysh;

/// Propagate a new nexthop (and address) of `port` to its dependents
///
/// `port` is the record as it was before the change.
pub async fn update_nexthop(
    ctx: &ReconcileContext,
    port: &PortConf,
    new_nexthop: &str,
    new_ip: &str,
) -> Result<()> {
    info!(port = %port.id, from = %port.nexthop, to = %new_nexthop, "nexthop fan-out");

    update_subnet_nexthop(ctx, port, new_nexthop, new_ip).await?;
    update_static_nexthop(ctx, port, new_nexthop, new_ip).await?;

    if id_contains(&port.id, "wan1") {
        {
            let _guard = ctx.locks().lock(&Kind::General.key("")).await;
            general::update_china_route(ctx, port, new_nexthop, new_ip).await?;
        }
        let _guard = ctx.locks().lock(&Kind::Dns.key("")).await;
        dns::update_resolv(ctx).await?;
        dns::update_domain_rule(ctx, port, new_nexthop).await?;
    }
    Ok(())
}

async fn update_subnet_nexthop(
    ctx: &ReconcileContext,
    port: &PortConf,
    new_nexthop: &str,
    new_ip: &str,
) -> Result<()> {
    let _guard = ctx.locks().lock(&Kind::Subnet.key(&port.id)).await;
    let Some(mut subnet) = ctx.load::<SubnetConf>(&port.id).await? else {
        return Ok(());
    };
    if subnet.nexthop == new_nexthop {
        return Ok(());
    }

    let exec = ctx.exec();
    let applied = if subnet.nexthop.is_empty() {
        vtysh::route_batch(exec, false, &subnet.cidrs, new_nexthop, ctx.settings.route_batch).await
    } else if new_nexthop.is_empty() {
        vtysh::route_batch(exec, true, &subnet.cidrs, &subnet.nexthop, ctx.settings.route_batch)
            .await
    } else {
        vtysh::route_batch_replace(
            exec,
            &subnet.cidrs,
            &subnet.nexthop,
            new_nexthop,
            ctx.settings.replace_batch,
        )
        .await
    };
    if let Err(e) = applied {
        warn!(subnet = %subnet.id, error = %e, "subnet route move failed");
    }

    subnet.nexthop = new_nexthop.to_string();
    subnet.dev_addr = new_ip.to_string();
    ctx.save(&subnet).await
}

async fn update_static_nexthop(
    ctx: &ReconcileContext,
    port: &PortConf,
    new_nexthop: &str,
    new_ip: &str,
) -> Result<()> {
    let candidates: Vec<String> = ctx
        .load_all::<StaticConf>()
        .await?
        .into_iter()
        .filter(|s| s.device.eq_ignore_ascii_case(&port.id))
        .map(|s| s.id)
        .collect();

    for id in candidates {
        let _guard = ctx.locks().lock(&Kind::Static.key(&id)).await;
        // Reload under the lock; the route may have moved or gone meanwhile
        let mut route = match ctx.load::<StaticConf>(&id).await {
            Ok(Some(route)) => route,
            Ok(None) => continue,
            Err(e) => {
                warn!(static_route = %id, error = %e, "static route unreadable");
                continue;
            }
        };
        if !route.device.eq_ignore_ascii_case(&port.id) || route.nexthop == new_nexthop {
            continue;
        }

        let exec = ctx.exec();
        let applied = if route.nexthop.is_empty() {
            vtysh::route(exec, false, &route.network, new_nexthop).await
        } else if new_nexthop.is_empty() {
            vtysh::route(exec, true, &route.network, &route.nexthop).await
        } else {
            vtysh::route_replace(exec, &route.network, &route.nexthop, new_nexthop).await
        };
        if let Err(e) = applied {
            warn!(static_route = %route.id, error = %e, "static route move failed");
        }

        route.nexthop = new_nexthop.to_string();
        route.dev_addr = new_ip.to_string();
        if let Err(e) = ctx.save(&route).await {
            warn!(static_route = %route.id, error = %e, "static route not persisted");
        }
    }
    Ok(())
}
