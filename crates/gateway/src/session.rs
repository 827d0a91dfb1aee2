//! Device session handler.
//!
//! One task per accepted tracker connection. The session is anonymous
//! until a valid login frame binds its IMEI; location and heartbeat frames
//! arriving earlier are dropped without an acknowledgment. Socket write
//! failures tear the session down; devices retransmit on their own, so
//! nothing here retries.

use crate::ingress::Ingress;
use futures::{SinkExt, StreamExt};
use gt06::{Ack, Gt06Codec, HemisphereMode, Packet};
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a device session needs, shared across connections.
#[derive(Clone)]
pub struct SessionContext {
    pub ingress: Ingress,
    pub hemisphere: HemisphereMode,
    /// Reads idle longer than this close the session.
    pub idle_timeout: Duration,
}

/// Drive one device connection until it closes, errors, idles out or the
/// gateway shuts down. On teardown a bound IMEI is flipped offline and the
/// transition broadcast.
pub async fn run(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: SessionContext,
    cancel: CancellationToken,
) {
    counter!("gateway_device_connections_total").increment(1);
    gauge!("gateway_active_sessions").increment(1.0);
    info!(%peer, "device connected");

    let mut framed = Framed::new(stream, Gt06Codec::new());
    let mut imei: Option<String> = None;

    loop {
        let frame = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!(%peer, "session closing for shutdown");
                break;
            }

            read = timeout(ctx.idle_timeout, framed.next()) => match read {
                Err(_) => {
                    info!(%peer, "device idle timeout");
                    break;
                }
                Ok(None) => {
                    info!(%peer, "device disconnected");
                    break;
                }
                Ok(Some(Err(e))) => {
                    info!(%peer, error = %e, "device connection error");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            },
        };

        counter!("gateway_frames_total").increment(1);

        let packet = match gt06::packet::parse(&frame, ctx.hemisphere) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%peer, protocol = frame.protocol, error = %e, "malformed payload, skipping frame");
                continue;
            }
        };

        match packet {
            Packet::Login { imei: id } => {
                let state = ctx.ingress.device_login(&id);
                debug!(%peer, imei = %id, known = state.lat.is_some(), "device login");

                if let Err(e) = framed.send(Ack::new(frame.protocol, frame.serial)).await {
                    info!(%peer, error = %e, "ack write failed");
                    break;
                }
                imei = Some(id);
            }

            Packet::Location(fix) => {
                let Some(id) = imei.as_deref() else {
                    warn!(%peer, "location before login, dropping");
                    continue;
                };

                if let Err(e) = framed.send(Ack::new(frame.protocol, frame.serial)).await {
                    info!(%peer, error = %e, "ack write failed");
                    break;
                }

                let state = ctx.ingress.device_fix(id, &fix);
                debug!(
                    %peer,
                    imei = %id,
                    lat = fix.lat,
                    lon = fix.lon,
                    last_update = %state.last_update,
                    "location ingested"
                );
            }

            Packet::Heartbeat => {
                let Some(id) = imei.as_deref() else {
                    warn!(%peer, "heartbeat before login, dropping");
                    continue;
                };

                debug!(%peer, imei = %id, "heartbeat");
                if let Err(e) = framed.send(Ack::new(frame.protocol, frame.serial)).await {
                    info!(%peer, error = %e, "ack write failed");
                    break;
                }
            }

            Packet::Unknown { protocol } => {
                warn!(%peer, protocol = format_args!("0x{protocol:02X}"), "unhandled protocol, no ack");
            }
        }
    }

    if let Some(id) = imei {
        ctx.ingress.device_offline(&id);
        info!(%peer, imei = %id, "device marked offline");
    }

    gauge!("gateway_active_sessions").decrement(1.0);
}
