// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Contacts, groups, distribution lists, call links and the release notes channel.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use super::{
    ACI_LEN, PROFILE_KEY_LEN, fetch_all, format_aci, from_sql_int, is_valid_e164, parse_aci,
    to_sql_int,
};
use crate::{
    archiver::{ArchiveMultiFrameResult, FrameSink, RecipientArchiver, RestoreFrameResult, write_frame},
    context::{ArchivingContext, PostFrameRestoreAction, RecipientId, RecipientKind, RestoringContext},
    frame_error::{
        ArchiveFrameError, ArchiveFrameErrorKind, InvalidProtoDataError, LoggableId,
        RestoreFrameError,
    },
    proto::{
        CallLink, Contact, DistributionListItem, Frame, Group, Recipient, ReleaseNotes, frame,
        recipient::Destination,
    },
};

const GROUP_MASTER_KEY_LEN: usize = 32;
const DISTRIBUTION_ID_LEN: usize = 16;

fn write_recipient(
    sink: &mut dyn FrameSink,
    id: RecipientId,
    destination: Destination,
    errors: &mut Vec<ArchiveFrameError>,
) {
    let frame = Frame::new(frame::Item::Recipient(Recipient {
        id: id.0,
        destination: Some(destination),
    }));
    if let Err(e) = write_frame(sink, &frame, || LoggableId::recipient(id.0)) {
        errors.push(e);
    }
}

fn stored(
    id: RecipientId,
    kind: RecipientKind,
    result: rusqlite::Result<i64>,
    ctx: &RestoringContext<'_>,
    partial: Vec<RestoreFrameError>,
) -> RestoreFrameResult<()> {
    match result {
        Ok(row_id) => {
            ctx.map_recipient(id, row_id, kind);
            if partial.is_empty() {
                RestoreFrameResult::Success(())
            } else {
                RestoreFrameResult::PartialRestore((), partial)
            }
        }
        Err(e) => RestoreFrameResult::failure(RestoreFrameError::database(
            &e,
            LoggableId::recipient(id.0),
        )),
    }
}

// ----------------------------------------------------------------------------
// Contacts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteContacts;

struct ContactRow {
    row_id: i64,
    aci: Option<String>,
    e164: Option<i64>,
    given_name: Option<String>,
    family_name: Option<String>,
    blocked: bool,
    profile_key: Option<Vec<u8>>,
}

impl RecipientArchiver<Contact> for SqliteContacts {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "contacts",
            "SELECT id, aci, e164, profile_given_name, profile_family_name, blocked, profile_key
             FROM recipient WHERE kind = 'contact' ORDER BY id",
            [],
            |row| {
                Ok(ContactRow {
                    row_id: row.get(0)?,
                    aci: row.get(1)?,
                    e164: row.get(2)?,
                    given_name: row.get(3)?,
                    family_name: row.get(4)?,
                    blocked: row.get(5)?,
                    profile_key: row.get(6)?,
                })
            },
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };

        let mut errors = Vec::new();
        for row in rows {
            let local_id = || LoggableId::local_row("recipient", row.row_id);
            let aci = match row.aci.as_deref().map(parse_aci) {
                Some(Some(bytes)) => Some(bytes),
                Some(None) => {
                    errors.push(ArchiveFrameError::new(
                        ArchiveFrameErrorKind::InvalidLocalData("malformed aci".to_string()),
                        local_id(),
                    ));
                    continue;
                }
                None => None,
            };
            let e164 = row.e164.map(from_sql_int).filter(|n| is_valid_e164(*n));
            if aci.is_none() && e164.is_none() {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::InvalidLocalData("contact has no identifier".to_string()),
                    local_id(),
                ));
                continue;
            }
            let id = ctx.assign_recipient_id(row.row_id);
            let contact = Contact {
                aci,
                e164,
                profile_given_name: row.given_name,
                profile_family_name: row.family_name,
                blocked: row.blocked,
                profile_key: row.profile_key,
            };
            write_recipient(sink, id, Destination::Contact(contact), &mut errors);
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, id: RecipientId, proto: &Contact, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let loggable = || LoggableId::recipient(id.0);
        let mut partial = Vec::new();

        let aci = match &proto.aci {
            Some(bytes) if bytes.len() == ACI_LEN => Some(format_aci(bytes)),
            Some(_) => {
                return RestoreFrameResult::failure(RestoreFrameError::invalid(
                    InvalidProtoDataError::InvalidAci,
                    loggable(),
                ));
            }
            None => None,
        };
        let e164 = match proto.e164 {
            Some(number) if is_valid_e164(number) => Some(to_sql_int(number)),
            Some(_) => {
                partial.push(RestoreFrameError::invalid(InvalidProtoDataError::InvalidE164, loggable()));
                None
            }
            None => None,
        };
        if aci.is_none() && e164.is_none() {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::ContactWithoutIdentifiers,
                loggable(),
            ));
        }
        let profile_key = match &proto.profile_key {
            Some(key) if key.len() == PROFILE_KEY_LEN => Some(key.clone()),
            Some(_) => {
                partial.push(RestoreFrameError::invalid(
                    InvalidProtoDataError::InvalidProfileKey,
                    loggable(),
                ));
                None
            }
            None => None,
        };

        let result = upsert_contact(ctx.conn, aci.as_deref(), e164, proto, profile_key.as_deref());
        stored(id, RecipientKind::Contact, result, ctx, partial)
    }
}

fn upsert_contact(
    conn: &Connection,
    aci: Option<&str>,
    e164: Option<i64>,
    proto: &Contact,
    profile_key: Option<&[u8]>,
) -> rusqlite::Result<i64> {
    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM recipient WHERE kind = 'contact' AND (aci = ?1 OR e164 = ?2) LIMIT 1",
            params![aci, e164],
            |row| row.get(0),
        )
        .optional()?;
    match existing {
        Some(row_id) => {
            conn.execute(
                "UPDATE recipient SET aci = COALESCE(?2, aci), e164 = COALESCE(?3, e164),
                     profile_given_name = ?4, profile_family_name = ?5, blocked = ?6,
                     profile_key = COALESCE(?7, profile_key)
                 WHERE id = ?1",
                params![
                    row_id,
                    aci,
                    e164,
                    proto.profile_given_name,
                    proto.profile_family_name,
                    proto.blocked,
                    profile_key
                ],
            )?;
            Ok(row_id)
        }
        None => {
            conn.execute(
                "INSERT INTO recipient (kind, aci, e164, profile_given_name, profile_family_name,
                     blocked, profile_key)
                 VALUES ('contact', ?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    aci,
                    e164,
                    proto.profile_given_name,
                    proto.profile_family_name,
                    proto.blocked,
                    profile_key
                ],
            )?;
            Ok(conn.last_insert_rowid())
        }
    }
}

// ----------------------------------------------------------------------------
// Groups
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteGroups;

impl RecipientArchiver<Group> for SqliteGroups {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "groups",
            "SELECT id, group_master_key, COALESCE(title, ''), whitelisted
             FROM recipient WHERE kind = 'group' ORDER BY id",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    Group {
                        master_key: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                        title: row.get(2)?,
                        whitelisted: row.get(3)?,
                    },
                ))
            },
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };

        let mut errors = Vec::new();
        for (row_id, group) in rows {
            if group.master_key.len() != GROUP_MASTER_KEY_LEN {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::InvalidLocalData("group master key".to_string()),
                    LoggableId::local_row("recipient", row_id),
                ));
                continue;
            }
            let id = ctx.assign_recipient_id(row_id);
            write_recipient(sink, id, Destination::Group(group), &mut errors);
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, id: RecipientId, proto: &Group, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        if proto.master_key.len() != GROUP_MASTER_KEY_LEN {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::InvalidGroupMasterKey,
                LoggableId::recipient(id.0),
            ));
        }
        let result = ctx.conn.query_row(
            "INSERT INTO recipient (kind, group_master_key, title, whitelisted)
             VALUES ('group', ?1, ?2, ?3)
             ON CONFLICT (group_master_key) DO UPDATE SET
                 title = excluded.title, whitelisted = excluded.whitelisted
             RETURNING id",
            params![proto.master_key, proto.title, proto.whitelisted],
            |row| row.get(0),
        );
        stored(id, RecipientKind::Group, result, ctx, Vec::new())
    }
}

// ----------------------------------------------------------------------------
// Distribution lists
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDistributionLists;

impl RecipientArchiver<DistributionListItem> for SqliteDistributionLists {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "distribution lists",
            "SELECT id, distribution_id, COALESCE(title, ''), deletion_timestamp
             FROM recipient WHERE kind = 'distribution_list' ORDER BY id",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };

        let mut errors = Vec::new();
        for (row_id, distribution_id, name, deletion_timestamp) in rows {
            let members = match fetch_all(
                ctx.conn,
                "distribution list members",
                "SELECT member_id FROM distribution_list_member WHERE list_id = ?1 ORDER BY member_id",
                [row_id],
                |row| row.get::<_, i64>(0),
            ) {
                Ok(members) => members,
                Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
            };
            let mut member_recipient_ids = Vec::with_capacity(members.len());
            for member in members {
                match ctx.recipient_id(member) {
                    Some(id) => member_recipient_ids.push(id.0),
                    None => errors.push(ArchiveFrameError::new(
                        ArchiveFrameErrorKind::ReferencedRecipientMissing(member),
                        LoggableId::local_row("recipient", row_id),
                    )),
                }
            }
            let id = ctx.assign_recipient_id(row_id);
            let list = DistributionListItem {
                distribution_id,
                name,
                member_recipient_ids,
                deletion_timestamp: deletion_timestamp.map(from_sql_int),
            };
            write_recipient(sink, id, Destination::DistributionList(list), &mut errors);
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(
        &self,
        id: RecipientId,
        proto: &DistributionListItem,
        ctx: &RestoringContext<'_>,
    ) -> RestoreFrameResult<()> {
        if proto.distribution_id.len() != DISTRIBUTION_ID_LEN {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::InvalidDistributionListId,
                LoggableId::recipient(id.0),
            ));
        }
        let result = ctx.conn.query_row(
            "INSERT INTO recipient (kind, distribution_id, title, deletion_timestamp)
             VALUES ('distribution_list', ?1, ?2, ?3)
             ON CONFLICT (distribution_id) DO UPDATE SET
                 title = excluded.title, deletion_timestamp = excluded.deletion_timestamp
             RETURNING id",
            params![
                proto.distribution_id,
                proto.name,
                proto.deletion_timestamp.map(to_sql_int)
            ],
            |row| row.get::<_, i64>(0),
        );
        if let Ok(list_row) = result
            && proto.deletion_timestamp.is_none()
            && !proto.member_recipient_ids.is_empty()
        {
            // members may appear later in the stream
            ctx.enqueue_post_frame_action(PostFrameRestoreAction::ResolveDistributionListMembers {
                list_row,
                members: proto.member_recipient_ids.iter().copied().map(RecipientId).collect(),
            });
        }
        stored(id, RecipientKind::DistributionList, result, ctx, Vec::new())
    }
}

// ----------------------------------------------------------------------------
// Release notes
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteReleaseNotes;

impl RecipientArchiver<ReleaseNotes> for SqliteReleaseNotes {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "release notes",
            "SELECT id FROM recipient WHERE kind = 'release_notes' ORDER BY id LIMIT 1",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };
        let mut errors = Vec::new();
        for row_id in rows {
            let id = ctx.assign_recipient_id(row_id);
            write_recipient(sink, id, Destination::ReleaseNotes(ReleaseNotes {}), &mut errors);
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, id: RecipientId, _proto: &ReleaseNotes, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let result = ctx
            .conn
            .query_row(
                "SELECT id FROM recipient WHERE kind = 'release_notes'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .and_then(|existing| match existing {
                Some(row_id) => Ok(row_id),
                None => {
                    ctx.conn
                        .execute("INSERT INTO recipient (kind) VALUES ('release_notes')", [])?;
                    Ok(ctx.conn.last_insert_rowid())
                }
            });
        stored(id, RecipientKind::ReleaseNotes, result, ctx, Vec::new())
    }
}

// ----------------------------------------------------------------------------
// Call links
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteCallLinks;

impl RecipientArchiver<CallLink> for SqliteCallLinks {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "call links",
            "SELECT id, call_link_root_key, COALESCE(title, ''), COALESCE(call_link_expiration_ms, 0)
             FROM recipient WHERE kind = 'call_link' ORDER BY id",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    CallLink {
                        root_key: row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                        name: row.get(2)?,
                        expiration_ms: from_sql_int(row.get(3)?),
                    },
                ))
            },
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };

        let mut errors = Vec::new();
        let mut expired = 0usize;
        for (row_id, link) in rows {
            if link.expiration_ms != 0 && link.expiration_ms < ctx.start_timestamp_ms {
                expired += 1;
                continue;
            }
            let id = ctx.assign_recipient_id(row_id);
            write_recipient(sink, id, Destination::CallLink(link), &mut errors);
        }
        if expired > 0 {
            debug!(expired, "skipped expired call links");
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, id: RecipientId, proto: &CallLink, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let result = ctx.conn.query_row(
            "INSERT INTO recipient (kind, call_link_root_key, title, call_link_expiration_ms)
             VALUES ('call_link', ?1, ?2, ?3)
             ON CONFLICT (call_link_root_key) DO UPDATE SET
                 title = excluded.title, call_link_expiration_ms = excluded.call_link_expiration_ms
             RETURNING id",
            params![proto.root_key, proto.name, to_sql_int(proto.expiration_ms)],
            |row| row.get(0),
        );
        stored(id, RecipientKind::CallLink, result, ctx, Vec::new())
    }
}
