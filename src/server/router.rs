//! Request routing and the attribute operations
//!
//! Plaintext endpoints: `POST /pair-setup`, `POST /pair-verify`,
//! `POST /identify`. Everything else requires a verified session and
//! arrives through the frame decryption in `ServerCore::process_data`.

use super::core::{RouteOutcome, ServerCore};
use super::ServerEvent;
use crate::accessory::{projection, HapStatus};
use crate::protocol::http::{HttpRequest, Method, ResponseBuilder, StatusCode};
use crate::protocol::pairing::{
    states, PairSetupContext, PairVerifyContext, SetupStep, VerifyStep,
};
use crate::protocol::tlv::{error_codes, methods, TlvDecoder, TlvEncoder, TlvType};
use crate::storage::{ControllerRecord, IdentityError};
use serde::Deserialize;
use serde_json::json;

/// HTTP 470, the HAP "secure session required" status.
const CONNECTION_AUTHORIZATION_REQUIRED: StatusCode = StatusCode(470);

/// Flags for `GET /accessories` and the config hash.
const ACCESSORIES_PROJECTION: u8 =
    projection::META | projection::PERMS | projection::TYPE | projection::DESC;

#[derive(Deserialize)]
struct WriteObject {
    aid: u32,
    iid: u32,
    value: Option<serde_json::Value>,
    ev: Option<serde_json::Value>,
    pid: Option<u64>,
}

#[derive(Deserialize)]
struct WriteBody {
    characteristics: Vec<WriteObject>,
}

#[derive(Deserialize)]
struct PrepareBody {
    ttl: u64,
    pid: u64,
}

impl ServerCore {
    pub(crate) async fn route(&mut self, slot: usize, request: &HttpRequest) -> RouteOutcome {
        let verified = self.slots[slot]
            .as_ref()
            .is_some_and(super::connection::Connection::is_verified);
        tracing::debug!(slot, method = request.method.as_str(), path = request.path(), verified, "request");

        match (request.method, request.path()) {
            (Method::Post, "/pair-setup") => self.pair_setup(slot, request).await,
            (Method::Post, "/pair-verify") => self.pair_verify(slot, request),
            (Method::Post, "/identify") => self.identify(),
            _ if !verified => {
                // Attribute endpoints exist only inside a secured session.
                let mut outcome = RouteOutcome::respond(
                    ResponseBuilder::new(CONNECTION_AUTHORIZATION_REQUIRED).encode(),
                );
                outcome.close = true;
                outcome
            }
            (Method::Get, "/accessories") => self.get_accessories(slot),
            (Method::Get, "/characteristics") => self.get_characteristics(slot, request),
            (Method::Put, "/characteristics") => self.put_characteristics(slot, request).await,
            (Method::Put, "/prepare") => self.put_prepare(request),
            (Method::Post, "/pairings") => self.pairings(slot, request).await,
            _ => RouteOutcome::respond(ResponseBuilder::new(StatusCode::NOT_FOUND).encode()),
        }
    }

    async fn pair_setup(&mut self, slot: usize, request: &HttpRequest) -> RouteOutcome {
        // Single in-flight setup: a second slot gets Busy, preserving the
        // exchange already underway.
        if self
            .setup_slot
            .is_some_and(|owner| owner != slot && self.slots[owner].is_some())
        {
            tracing::warn!(slot, "pair-setup while another exchange is in flight");
            let reply = TlvEncoder::new()
                .add_state(states::M2)
                .add_error(error_codes::BUSY)
                .build();
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::OK).pairing_tlv8(reply).encode(),
            );
        }

        let Some(mut machine) = self.slots[slot]
            .as_mut()
            .map(|conn| std::mem::take(&mut conn.pair_setup))
        else {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        };

        let ctx = PairSetupContext {
            accessory_id: self.identity.device_id(),
            signing_key: self.identity.signing_key(),
            verifier: self.verifier.as_ref(),
            paired: self.controllers.is_paired(),
        };
        let result = machine.handle(&request.body, &ctx);

        let outcome = match result {
            Ok(SetupStep::Reply(reply)) => {
                self.setup_slot = machine.in_progress().then_some(slot);
                RouteOutcome::respond(
                    ResponseBuilder::new(StatusCode::OK).pairing_tlv8(reply).encode(),
                )
            }
            Ok(SetupStep::Complete { reply, controller }) => {
                self.setup_slot = None;
                match self.enroll_controller(controller).await {
                    Ok(()) => {
                        let mut outcome = RouteOutcome::respond(
                            ResponseBuilder::new(StatusCode::OK).pairing_tlv8(reply).encode(),
                        );
                        outcome.txt_refresh = true;
                        outcome.emit.push(ServerEvent::Paired);
                        outcome
                    }
                    Err(error) => {
                        tracing::error!(%error, "failed to persist controller");
                        let reply = TlvEncoder::new()
                            .add_state(states::M6)
                            .add_error(error_codes::MAX_PEERS)
                            .build();
                        RouteOutcome::respond(
                            ResponseBuilder::new(StatusCode::OK).pairing_tlv8(reply).encode(),
                        )
                    }
                }
            }
            Err(error) => {
                tracing::warn!(slot, %error, "pair-setup failed");
                self.setup_slot = None;
                RouteOutcome::respond(
                    ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
                )
            }
        };

        if let Some(conn) = self.slots[slot].as_mut() {
            conn.pair_setup = machine;
        }
        outcome
    }

    async fn enroll_controller(&mut self, controller: ControllerRecord) -> Result<(), IdentityError> {
        self.controllers.add(controller)?;
        self.controllers.save(self.store.as_mut()).await?;
        Ok(())
    }

    fn pair_verify(&mut self, slot: usize, request: &HttpRequest) -> RouteOutcome {
        let Some(mut machine) = self.slots[slot]
            .as_mut()
            .map(|conn| std::mem::take(&mut conn.pair_verify))
        else {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        };

        let ctx = PairVerifyContext {
            accessory_id: self.identity.device_id(),
            signing_key: self.identity.signing_key(),
            controllers: &self.controllers,
        };
        let result = machine.handle(&request.body, &ctx);

        let outcome = match result {
            Ok(VerifyStep::Reply(reply)) => RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::OK).pairing_tlv8(reply).encode(),
            ),
            Ok(VerifyStep::Verified {
                reply,
                controller_id,
                keys,
            }) => {
                let mut outcome = RouteOutcome::respond(
                    ResponseBuilder::new(StatusCode::OK).pairing_tlv8(reply).encode(),
                );
                outcome.install_keys = Some((controller_id, keys));
                outcome
            }
            Err(error) => {
                tracing::warn!(slot, %error, "pair-verify failed");
                RouteOutcome::respond(
                    ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
                )
            }
        };

        if let Some(conn) = self.slots[slot].as_mut() {
            conn.pair_verify = machine;
        }
        outcome
    }

    fn identify(&mut self) -> RouteOutcome {
        if self.controllers.is_paired() {
            // Identify over plain HTTP is only for unpaired devices.
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST)
                    .hap_json(&json!({ "status": HapStatus::InsufficientPrivileges.code() }))
                    .encode(),
            );
        }

        tracing::info!("identify routine requested");
        let mut outcome =
            RouteOutcome::respond(ResponseBuilder::new(StatusCode::NO_CONTENT).encode());
        outcome.emit.push(ServerEvent::IdentifyRequested);
        outcome
    }

    fn get_accessories(&self, slot: usize) -> RouteOutcome {
        let body = self.db.to_json(slot, ACCESSORIES_PROJECTION);
        RouteOutcome::respond(ResponseBuilder::new(StatusCode::OK).hap_json(&body).encode())
    }

    fn get_characteristics(&self, slot: usize, request: &HttpRequest) -> RouteOutcome {
        let query = request.query();
        let param = |name: &str| {
            query
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| *value)
        };
        let flag = |name: &str| matches!(param(name), Some("1" | "true"));

        let Some(ids_param) = param("id") else {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        };

        let mut ids: Vec<(u32, u32)> = Vec::new();
        for pair in ids_param.split(',') {
            let Some((aid, iid)) = pair
                .split_once('.')
                .and_then(|(a, i)| Some((a.parse().ok()?, i.parse().ok()?)))
            else {
                return RouteOutcome::respond(
                    ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
                );
            };
            ids.push((aid, iid));
        }

        let mut flags = projection::AID;
        if flag("meta") {
            flags |= projection::META;
        }
        if flag("perms") {
            flags |= projection::PERMS;
        }
        if flag("type") {
            flags |= projection::TYPE;
        }
        if flag("ev") {
            flags |= projection::EV;
        }

        let mut objects = Vec::with_capacity(ids.len());
        let mut statuses = Vec::with_capacity(ids.len());
        for (aid, iid) in ids {
            match self.db.find(aid, iid) {
                None => {
                    objects.push(json!({ "aid": aid, "iid": iid }));
                    statuses.push(HapStatus::UnknownResource);
                }
                Some(characteristic)
                    if characteristic.perms() & crate::accessory::perms::PR == 0 =>
                {
                    objects.push(json!({ "aid": aid, "iid": iid }));
                    statuses.push(HapStatus::WriteOnly);
                }
                Some(characteristic) => {
                    objects.push(characteristic.to_json(aid, slot, flags));
                    statuses.push(HapStatus::Ok);
                }
            }
        }

        let all_ok = statuses.iter().all(|s| *s == HapStatus::Ok);
        if !all_ok {
            for (object, status) in objects.iter_mut().zip(&statuses) {
                if let Some(map) = object.as_object_mut() {
                    map.insert("status".into(), json!(status.code()));
                }
            }
        }

        let status = if all_ok {
            StatusCode::OK
        } else {
            StatusCode::MULTI_STATUS
        };
        RouteOutcome::respond(
            ResponseBuilder::new(status)
                .hap_json(&json!({ "characteristics": objects }))
                .encode(),
        )
    }

    async fn put_characteristics(&mut self, slot: usize, request: &HttpRequest) -> RouteOutcome {
        let Ok(body) = serde_json::from_slice::<WriteBody>(&request.body) else {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        };
        let objects = body.characteristics;
        if objects.is_empty()
            || objects
                .iter()
                .any(|o| o.value.is_none() && o.ev.is_none())
        {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        }

        let now = self.clock.now_ms();

        // A bad or expired timed-write pid invalidates the whole request.
        let mut timed_write_failed = false;
        for object in &objects {
            if let Some(pid) = object.pid {
                match self.timed_writes.remove(&pid) {
                    Some(deadline) if deadline >= now => {}
                    Some(_) => {
                        tracing::warn!(pid, "timed write expired");
                        timed_write_failed = true;
                    }
                    None => {
                        tracing::warn!(pid, "timed write pid unknown");
                        timed_write_failed = true;
                    }
                }
            }
        }

        // Pass 1: locate targets and stage each write.
        let mut statuses = Vec::with_capacity(objects.len());
        for object in &objects {
            if timed_write_failed {
                statuses.push(HapStatus::InvalidValue);
                continue;
            }
            match self.db.find_mut(object.aid, object.iid) {
                None => statuses.push(HapStatus::UnknownResource),
                Some(characteristic) => statuses.push(characteristic.load_update(
                    object.value.as_ref(),
                    object.ev.as_ref(),
                    slot,
                    now,
                )),
            }
        }

        // Pass 2: one update() per touched service, then commit or roll
        // back every staged write it covers.
        let mut notify = Vec::new();
        for index in 0..objects.len() {
            if statuses[index] != HapStatus::Tbd {
                continue;
            }
            let Some(service_key) = self
                .db
                .find_service_of(objects[index].aid, objects[index].iid)
            else {
                statuses[index] = HapStatus::UnknownResource;
                continue;
            };

            let members: Vec<usize> = (index..objects.len())
                .filter(|&j| {
                    statuses[j] == HapStatus::Tbd
                        && self.db.find_service_of(objects[j].aid, objects[j].iid)
                            == Some(service_key)
                })
                .collect();

            let changes: Vec<crate::accessory::CharacteristicChange> = members
                .iter()
                .filter_map(|&j| {
                    let characteristic = self.db.find(objects[j].aid, objects[j].iid)?;
                    Some(crate::accessory::CharacteristicChange {
                        aid: objects[j].aid,
                        iid: objects[j].iid,
                        hap_type: characteristic.hap_type().to_string(),
                        current: characteristic.value().clone(),
                        staged: characteristic.staged_value().clone(),
                    })
                })
                .collect();

            let (acc_index, svc_index) = service_key;
            let mut handler = self.db.accessory_mut(acc_index).services[svc_index]
                .handler
                .take();
            let accepted = handler
                .as_mut()
                .map_or(true, |h| h.update(&changes));
            self.db.accessory_mut(acc_index).services[svc_index].handler = handler;

            for &j in &members {
                if let Some(characteristic) = self.db.find_mut(objects[j].aid, objects[j].iid) {
                    characteristic.finish_update(accepted);
                }
                statuses[j] = if accepted {
                    HapStatus::Ok
                } else {
                    HapStatus::Unable
                };
                if accepted && objects[j].value.is_some() {
                    notify.push((objects[j].aid, objects[j].iid));
                }
            }

            // Changes the handler pushed during update() ride in the same
            // notification batch as the commit itself.
            if accepted {
                notify.extend(self.poll_service(acc_index, svc_index, now));
            }
        }

        let all_ok = statuses.iter().all(|s| *s == HapStatus::Ok);
        let response = if all_ok {
            ResponseBuilder::new(StatusCode::NO_CONTENT).encode()
        } else {
            let report: Vec<serde_json::Value> = objects
                .iter()
                .zip(&statuses)
                .map(|(object, status)| {
                    json!({ "aid": object.aid, "iid": object.iid, "status": status.code() })
                })
                .collect();
            ResponseBuilder::new(StatusCode::MULTI_STATUS)
                .hap_json(&json!({ "characteristics": report }))
                .encode()
        };

        let mut outcome = RouteOutcome::respond(response);
        outcome.notify = notify;
        outcome
    }

    fn put_prepare(&mut self, request: &HttpRequest) -> RouteOutcome {
        let Ok(body) = serde_json::from_slice::<PrepareBody>(&request.body) else {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        };

        let deadline = self.clock.now_ms() + body.ttl;
        self.timed_writes.insert(body.pid, deadline);
        tracing::debug!(pid = body.pid, ttl = body.ttl, "timed write armed");

        RouteOutcome::respond(
            ResponseBuilder::new(StatusCode::OK)
                .hap_json(&json!({ "status": HapStatus::Ok.code() }))
                .encode(),
        )
    }

    async fn pairings(&mut self, slot: usize, request: &HttpRequest) -> RouteOutcome {
        let tlv_reply = |tlv: Vec<u8>| {
            RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::OK).pairing_tlv8(tlv).encode(),
            )
        };
        let error_reply = |code: u8| {
            tlv_reply(
                TlvEncoder::new()
                    .add_state(states::M2)
                    .add_error(code)
                    .build(),
            )
        };

        let Ok(tlv) = TlvDecoder::decode(&request.body) else {
            return RouteOutcome::respond(
                ResponseBuilder::new(StatusCode::BAD_REQUEST).encode(),
            );
        };
        let Some(method) = tlv.get_u8(TlvType::Method) else {
            return error_reply(error_codes::UNKNOWN);
        };

        // Only admin controllers may administer the pairing list.
        let is_admin = self.slots[slot]
            .as_ref()
            .and_then(|conn| conn.verified.as_deref())
            .and_then(|id| self.controllers.find(id))
            .is_some_and(|record| record.admin);
        if !is_admin {
            tracing::warn!(slot, "pairings request from non-admin controller");
            return error_reply(error_codes::AUTHENTICATION);
        }

        match method {
            methods::ADD_PAIRING => {
                let (Some(identifier), Some(ltpk), Some(permissions)) = (
                    tlv.get(TlvType::Identifier),
                    tlv.get(TlvType::PublicKey),
                    tlv.get_u8(TlvType::Permissions),
                ) else {
                    return error_reply(error_codes::UNKNOWN);
                };
                let Ok(ltpk) = <[u8; 32]>::try_from(ltpk) else {
                    return error_reply(error_codes::UNKNOWN);
                };

                // A known identifier must present the same key.
                if let Some(existing) = self.controllers.find(identifier) {
                    if existing.ltpk != ltpk {
                        return error_reply(error_codes::UNKNOWN);
                    }
                }

                let record = ControllerRecord {
                    pairing_id: identifier.to_vec(),
                    ltpk,
                    admin: permissions & 0x01 != 0,
                };
                if let Err(error) = self.enroll_controller(record).await {
                    tracing::warn!(%error, "add-pairing failed");
                    return error_reply(error_codes::MAX_PEERS);
                }

                tracing::info!("controller added via add-pairing");
                tlv_reply(TlvEncoder::new().add_state(states::M2).build())
            }

            methods::REMOVE_PAIRING => {
                let Some(identifier) = tlv.get(TlvType::Identifier) else {
                    return error_reply(error_codes::UNKNOWN);
                };

                let removed = self.controllers.remove(identifier);
                if removed.is_some() {
                    tracing::info!("controller removed via remove-pairing");
                }

                // Losing the last admin unpairs the device entirely.
                let mut outcome = tlv_reply(TlvEncoder::new().add_state(states::M2).build());
                if !self.controllers.is_paired() {
                    tracing::info!("last admin removed, unpairing device");
                    self.controllers.clear();
                    outcome.close_all = true;
                    outcome.txt_refresh = true;
                    outcome.emit.push(ServerEvent::Unpaired);
                }
                if let Err(error) = self.controllers.save(self.store.as_mut()).await {
                    tracing::error!(%error, "failed to persist controller table");
                }
                outcome
            }

            methods::LIST_PAIRINGS => {
                let mut encoder = TlvEncoder::new().add_state(states::M2);
                let mut first = true;
                for record in self.controllers.iter() {
                    if !first {
                        encoder = encoder.add_separator();
                    }
                    first = false;
                    encoder = encoder
                        .add(TlvType::Identifier, &record.pairing_id)
                        .add(TlvType::PublicKey, &record.ltpk)
                        .add_u8(TlvType::Permissions, u8::from(record.admin));
                }
                tlv_reply(encoder.build())
            }

            _ => error_reply(error_codes::UNKNOWN),
        }
    }
}
