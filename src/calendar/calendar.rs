use chrono::{DateTime, Duration, Months, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use poise::serenity_prelude::{ChannelId, GuildId, RoleId, UserId};
use serde::{Deserialize, Serialize};

use super::{CalendarError, Event, EventDraft, Repeat, RepeatPatch};

/// Every permission node a guild can deny. Commands check against their
/// node before doing anything; `perms` subcommands validate user input
/// against this table.
pub const NODES: &[&str] = &[
    "event.create",
    "event.update",
    "event.delete",
    "event.list",
    "prefix.show",
    "prefix.modify",
    "defaultchannel.show",
    "defaultchannel.modify",
    "timezone.show",
    "timezone.modify",
    "perms.modify",
    "perms.nodes",
    "perms.show",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Denial entry for one permission node. A node without an entry denies
/// nobody.
pub struct PermissionNode {
    pub node: String,
    pub denied_roles: Vec<RoleId>,
    pub denied_users: Vec<UserId>,
}

/// Per-guild aggregate: the event list plus the guild's own settings.
///
/// `events` is kept ascending by start instant across every mutation;
/// positional commands (delete, update) rely on the displayed order and
/// the stored order being the same thing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub guild_id: GuildId,
    pub prefix: String,
    pub default_channel: Option<ChannelId>,
    /// Unset until the guild runs `init`. Event commands refuse to run
    /// without it.
    pub timezone: Option<Tz>,
    pub events: Vec<Event>,
    pub permissions: Vec<PermissionNode>,
}

impl Calendar {
    pub fn new(guild_id: GuildId, prefix: String) -> Self {
        Self {
            guild_id,
            prefix,
            default_channel: None,
            timezone: None,
            events: Vec::new(),
            permissions: Vec::new(),
        }
    }

    /// Inserts before the first event starting at the same instant or
    /// later, so a new event precedes existing ones it ties with.
    fn insert_sorted(&mut self, event: Event) -> usize {
        let index = self
            .events
            .iter()
            .position(|existing| existing.start >= event.start)
            .unwrap_or(self.events.len());
        self.events.insert(index, event);
        index
    }

    /// Builds an event from the draft and stores it at its sorted
    /// position. The draft must carry at least a name and a start; the
    /// end falls back to the start (zero-length event) when absent.
    pub fn add_event(&mut self, draft: EventDraft) -> Result<Event, CalendarError> {
        let (Some(name), Some(start)) = (draft.name, draft.start) else {
            return Err(CalendarError::IncompleteDraft);
        };
        let end = draft.end.unwrap_or(start);
        if end < start {
            return Err(CalendarError::IncompleteDraft);
        }

        let repeat = match draft.repeat {
            Some(RepeatPatch::Every(repeat)) => Some(repeat),
            Some(RepeatPatch::Off) | None => None,
        };

        let event = Event {
            id: uuid::Uuid::new_v4(),
            name,
            description: draft.description,
            start,
            end,
            repeat,
        };

        let index = self.insert_sorted(event);
        Ok(self.events[index].clone())
    }

    /// Removes the event at a display position.
    pub fn delete_event(&mut self, index: usize) -> Result<Event, CalendarError> {
        if index >= self.events.len() {
            return Err(CalendarError::NotFound);
        }
        Ok(self.events.remove(index))
    }

    /// Applies the present fields of the draft onto the event at `index`
    /// and moves it to its (possibly new) sorted position. Absent fields
    /// keep their value; `RepeatPatch::Off` clears the repeat mode.
    pub fn update_event(
        &mut self,
        index: usize,
        draft: &EventDraft,
    ) -> Result<Event, CalendarError> {
        if index >= self.events.len() {
            return Err(CalendarError::NotFound);
        }
        let mut event = self.events.remove(index);

        if let Some(name) = &draft.name {
            event.name = name.clone();
        }
        if let Some(start) = draft.start {
            event.start = start;
        }
        if let Some(end) = draft.end {
            event.end = end;
        }
        if let Some(description) = &draft.description {
            event.description = Some(description.clone());
        }
        match draft.repeat {
            Some(RepeatPatch::Off) => event.repeat = None,
            Some(RepeatPatch::Every(repeat)) => event.repeat = Some(repeat),
            None => {}
        }
        debug_assert!(event.start <= event.end);

        let index = self.insert_sorted(event);
        Ok(self.events[index].clone())
    }

    /// Finalization of an ended event: a one-shot event is removed, a
    /// repeating one advances by exactly one unit and is reinserted at
    /// its new position. Returns the advanced event, or `None` when the
    /// event was deleted, so the scheduler knows whether to re-arm it.
    pub fn advance_or_delete(&mut self, event_id: uuid::Uuid) -> Result<Option<Event>, CalendarError> {
        let index = self
            .events
            .iter()
            .position(|event| event.id == event_id)
            .ok_or(CalendarError::NotFound)?;

        let Some(repeat) = self.events[index].repeat else {
            self.events.remove(index);
            return Ok(None);
        };

        let mut event = self.events.remove(index);
        event.start = advance_by(event.start, repeat);
        event.end = advance_by(event.end, repeat);
        let index = self.insert_sorted(event);
        Ok(Some(self.events[index].clone()))
    }

    /// Re-expresses every event instant in a new zone by shifting it with
    /// the difference of the two zones' UTC offsets. Rejected wholesale
    /// (`Ok(None)`, nothing changed) when the earliest event would land in
    /// the past. On success returns the shifted events; the caller must
    /// reschedule every one of them, the aggregate never talks to the
    /// scheduler itself.
    pub fn update_timezone(
        &mut self,
        zone: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Event>>, CalendarError> {
        let new_tz: Tz = zone
            .parse()
            .map_err(|_| CalendarError::InvalidZone(zone.to_string()))?;

        let Some(old_tz) = self.timezone else {
            // first assignment, nothing to shift yet
            self.timezone = Some(new_tz);
            return Ok(Some(Vec::new()));
        };

        if self.events.is_empty() {
            self.timezone = Some(new_tz);
            return Ok(Some(Vec::new()));
        }

        let mut shifted: Vec<Event> = self
            .events
            .iter()
            .map(|event| Event {
                start: offset_shift(event.start, old_tz, new_tz),
                end: offset_shift(event.end, old_tz, new_tz),
                ..event.clone()
            })
            .collect();

        if shifted[0].start < now {
            return Ok(None);
        }

        // offsets are evaluated per instant, a DST edge between two events
        // could reorder them
        shifted.sort_by_key(|event| event.start);
        self.events = shifted;
        self.timezone = Some(new_tz);
        Ok(Some(self.events.clone()))
    }

    pub fn update_prefix(&mut self, prefix: String) {
        self.prefix = prefix;
    }

    pub fn update_default_channel(&mut self, channel: ChannelId) {
        self.default_channel = Some(channel);
    }

    fn node_entry(&mut self, node: &str) -> &mut PermissionNode {
        let index = self
            .permissions
            .iter()
            .position(|perm| perm.node == node)
            .unwrap_or_else(|| {
                self.permissions.push(PermissionNode {
                    node: node.to_string(),
                    denied_roles: Vec::new(),
                    denied_users: Vec::new(),
                });
                self.permissions.len() - 1
            });
        &mut self.permissions[index]
    }

    pub fn deny_role_perm(&mut self, role: RoleId, node: &str) {
        let entry = self.node_entry(node);
        if !entry.denied_roles.contains(&role) {
            entry.denied_roles.push(role);
        }
    }

    pub fn deny_user_perm(&mut self, user: UserId, node: &str) {
        let entry = self.node_entry(node);
        if !entry.denied_users.contains(&user) {
            entry.denied_users.push(user);
        }
    }

    pub fn allow_role_perm(&mut self, role: RoleId, node: &str) {
        if let Some(perm) = self.permissions.iter_mut().find(|perm| perm.node == node) {
            perm.denied_roles.retain(|denied| *denied != role);
        }
    }

    pub fn allow_user_perm(&mut self, user: UserId, node: &str) {
        if let Some(perm) = self.permissions.iter_mut().find(|perm| perm.node == node) {
            perm.denied_users.retain(|denied| *denied != user);
        }
    }

    /// Strips a departed member from every denial list.
    pub fn forget_user(&mut self, user: UserId) {
        for perm in &mut self.permissions {
            perm.denied_users.retain(|denied| *denied != user);
        }
    }

    /// Strips a deleted role from every denial list.
    pub fn forget_role(&mut self, role: RoleId) {
        for perm in &mut self.permissions {
            perm.denied_roles.retain(|denied| *denied != role);
        }
    }

    /// Deny-list check. The guild owner always passes; everyone else is
    /// allowed unless their id or one of their roles is denied for the
    /// node.
    pub fn check_perm(
        &self,
        node: &str,
        user: UserId,
        roles: &[RoleId],
        is_owner: bool,
    ) -> bool {
        if is_owner {
            return true;
        }

        let Some(perm) = self.permissions.iter().find(|perm| perm.node == node) else {
            return true;
        };

        if perm.denied_users.contains(&user) {
            return false;
        }

        !perm
            .denied_roles
            .iter()
            .any(|denied| roles.contains(denied))
    }
}

/// One recurrence step. Months go through the calendar (Jan 31 + 1 month
/// clamps to the last day of February), days and weeks are fixed spans.
fn advance_by(instant: DateTime<Utc>, repeat: Repeat) -> DateTime<Utc> {
    match repeat {
        Repeat::Daily => instant + Duration::days(1),
        Repeat::Weekly => instant + Duration::weeks(1),
        Repeat::Monthly => instant
            .checked_add_months(Months::new(1))
            // only fails around the representable range ends
            .unwrap_or(instant),
    }
}

/// Moves an instant by the offset difference between two zones, i.e. the
/// instant a wall clock reading in `from` denotes once reinterpreted in
/// `to`.
fn offset_shift(instant: DateTime<Utc>, from: Tz, to: Tz) -> DateTime<Utc> {
    let from_offset = from
        .offset_from_utc_datetime(&instant.naive_utc())
        .fix()
        .local_minus_utc();
    let to_offset = to
        .offset_from_utc_datetime(&instant.naive_utc())
        .fix()
        .local_minus_utc();

    instant + Duration::seconds(i64::from(from_offset - to_offset))
}

#[cfg(test)]
mod test {
    use chrono::{Duration, TimeZone, Utc};
    use poise::serenity_prelude::{ChannelId, GuildId, RoleId, UserId};

    use crate::calendar::{CalendarError, EventDraft, Repeat, RepeatPatch};

    use super::Calendar;

    fn calendar() -> Calendar {
        Calendar::new(GuildId::new(1), "+".to_string())
    }

    fn draft(name: &str, start: chrono::DateTime<Utc>) -> EventDraft {
        EventDraft {
            name: Some(name.to_string()),
            start: Some(start),
            end: Some(start + Duration::hours(1)),
            ..EventDraft::default()
        }
    }

    #[test]
    fn add_events_keeps_start_order() {
        let mut cal = calendar();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        cal.add_event(draft("third", base + Duration::hours(5))).unwrap();
        cal.add_event(draft("first", base)).unwrap();
        cal.add_event(draft("second", base + Duration::hours(2))).unwrap();

        let names: Vec<&str> = cal.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
        assert!(cal.events.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[test]
    fn equal_start_inserts_before_existing() {
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

        cal.add_event(draft("older", start)).unwrap();
        cal.add_event(draft("newer", start)).unwrap();

        let names: Vec<&str> = cal.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["newer", "older"]);
    }

    #[test]
    fn delete_out_of_bounds_is_not_found() {
        let mut cal = calendar();
        assert_eq!(cal.delete_event(0), Err(CalendarError::NotFound));

        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        cal.add_event(draft("only", start)).unwrap();
        assert_eq!(cal.delete_event(3), Err(CalendarError::NotFound));

        let removed = cal.delete_event(0).unwrap();
        assert_eq!(removed.name, "only");
        assert!(cal.events.is_empty());
    }

    #[test]
    fn update_patches_only_present_fields() {
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut added = draft("meeting", start);
        added.description = Some("weekly sync".to_string());
        added.repeat = Some(RepeatPatch::Every(Repeat::Weekly));
        cal.add_event(added).unwrap();

        let patch = EventDraft {
            description: Some("moved to room 2".to_string()),
            ..EventDraft::default()
        };
        let updated = cal.update_event(0, &patch).unwrap();

        assert_eq!(updated.name, "meeting");
        assert_eq!(updated.start, start);
        assert_eq!(updated.description.as_deref(), Some("moved to room 2"));
        assert_eq!(updated.repeat, Some(Repeat::Weekly));
    }

    #[test]
    fn update_repeat_off_clears_repeat() {
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut added = draft("meeting", start);
        added.repeat = Some(RepeatPatch::Every(Repeat::Daily));
        cal.add_event(added).unwrap();

        let patch = EventDraft {
            repeat: Some(RepeatPatch::Off),
            ..EventDraft::default()
        };
        let updated = cal.update_event(0, &patch).unwrap();
        assert_eq!(updated.repeat, None);
    }

    #[test]
    fn update_moves_event_to_new_sorted_position() {
        let mut cal = calendar();
        let base = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        cal.add_event(draft("a", base)).unwrap();
        cal.add_event(draft("b", base + Duration::hours(1))).unwrap();

        // push "a" past "b"
        let patch = EventDraft {
            start: Some(base + Duration::hours(3)),
            end: Some(base + Duration::hours(4)),
            ..EventDraft::default()
        };
        cal.update_event(0, &patch).unwrap();

        let names: Vec<&str> = cal.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn update_out_of_bounds_is_not_found() {
        let mut cal = calendar();
        let patch = EventDraft::default();
        assert_eq!(cal.update_event(0, &patch), Err(CalendarError::NotFound));
    }

    #[test]
    fn advance_removes_one_shot_events() {
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let event = cal.add_event(draft("once", start)).unwrap();

        assert_eq!(cal.advance_or_delete(event.id), Ok(None));
        assert!(cal.events.is_empty());
    }

    #[test]
    fn advance_moves_repeating_events_forward() {
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let mut added = draft("standup", start);
        added.repeat = Some(RepeatPatch::Every(Repeat::Daily));
        let event = cal.add_event(added).unwrap();
        cal.add_event(draft("later", start + Duration::hours(6))).unwrap();

        let advanced = cal.advance_or_delete(event.id).unwrap().unwrap();

        assert_eq!(advanced.id, event.id);
        assert!(advanced.start > event.start);
        assert_eq!(advanced.start, event.start + Duration::days(1));
        assert_eq!(advanced.end, event.end + Duration::days(1));
        // reinserted behind the event it now follows
        let names: Vec<&str> = cal.events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["later", "standup"]);
    }

    #[test]
    fn monthly_advance_clamps_to_valid_dates() {
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2025, 1, 31, 9, 0, 0).unwrap();
        let mut added = draft("rent", start);
        added.repeat = Some(RepeatPatch::Every(Repeat::Monthly));
        let event = cal.add_event(added).unwrap();

        let advanced = cal.advance_or_delete(event.id).unwrap().unwrap();
        assert_eq!(
            advanced.start,
            Utc.with_ymd_and_hms(2025, 2, 28, 9, 0, 0).unwrap()
        );

        // leap year lands on the 29th
        let mut cal = calendar();
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        let mut added = draft("rent", start);
        added.repeat = Some(RepeatPatch::Every(Repeat::Monthly));
        let event = cal.add_event(added).unwrap();

        let advanced = cal.advance_or_delete(event.id).unwrap().unwrap();
        assert_eq!(
            advanced.start,
            Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn advance_unknown_id_is_not_found() {
        let mut cal = calendar();
        assert_eq!(
            cal.advance_or_delete(uuid::Uuid::new_v4()),
            Err(CalendarError::NotFound)
        );
    }

    #[test]
    fn timezone_update_rejects_unknown_zones() {
        let mut cal = calendar();
        assert_eq!(
            cal.update_timezone("Mars/Olympus_Mons", Utc::now()),
            Err(CalendarError::InvalidZone("Mars/Olympus_Mons".to_string()))
        );
    }

    #[test]
    fn timezone_update_rejects_shifts_into_the_past() {
        let mut cal = calendar();
        cal.update_timezone("UTC", Utc::now()).unwrap();

        // event starting in 30 minutes; Paris is UTC+1 in January, so the
        // shift moves it one hour back, into the past
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        cal.add_event(draft("soon", now + Duration::minutes(30))).unwrap();

        let before = cal.clone();
        assert_eq!(cal.update_timezone("Europe/Paris", now), Ok(None));
        assert_eq!(cal, before);
    }

    #[test]
    fn timezone_update_shifts_all_events() {
        let mut cal = calendar();
        cal.update_timezone("UTC", Utc::now()).unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap();
        let start = now + Duration::minutes(30);
        cal.add_event(draft("soon", start)).unwrap();

        // New York is UTC-5 in January: everything moves 5 hours forward
        let shifted = cal
            .update_timezone("America/New_York", now)
            .unwrap()
            .expect("shift into the future must be accepted");

        assert_eq!(shifted.len(), 1);
        assert_eq!(shifted[0].start, start + Duration::hours(5));
        assert_eq!(cal.events[0].start, start + Duration::hours(5));
        assert_eq!(cal.events[0].end, start + Duration::hours(6));
        assert_eq!(cal.timezone, Some(chrono_tz::America::New_York));
    }

    #[test]
    fn owner_always_passes_perm_checks() {
        let mut cal = calendar();
        let owner = UserId::new(10);
        cal.deny_user_perm(owner, "event.create");

        assert!(cal.check_perm("event.create", owner, &[], true));
        assert!(!cal.check_perm("event.create", owner, &[], false));
    }

    #[test]
    fn denied_role_blocks_the_node() {
        let mut cal = calendar();
        let role = RoleId::new(20);
        cal.deny_role_perm(role, "event.delete");

        let user = UserId::new(11);
        assert!(!cal.check_perm("event.delete", user, &[role], false));
        assert!(cal.check_perm("event.delete", user, &[RoleId::new(21)], false));
        // other nodes stay open
        assert!(cal.check_perm("event.create", user, &[role], false));
    }

    #[test]
    fn missing_entry_allows_everyone() {
        let cal = calendar();
        assert!(cal.check_perm("event.list", UserId::new(5), &[RoleId::new(6)], false));
    }

    #[test]
    fn allow_reverses_deny() {
        let mut cal = calendar();
        let user = UserId::new(11);
        cal.deny_user_perm(user, "event.create");
        assert!(!cal.check_perm("event.create", user, &[], false));

        cal.allow_user_perm(user, "event.create");
        assert!(cal.check_perm("event.create", user, &[], false));
    }

    #[test]
    fn forget_user_clears_every_entry() {
        let mut cal = calendar();
        let user = UserId::new(11);
        cal.deny_user_perm(user, "event.create");
        cal.deny_user_perm(user, "event.delete");

        cal.forget_user(user);
        assert!(cal.check_perm("event.create", user, &[], false));
        assert!(cal.check_perm("event.delete", user, &[], false));
    }

    #[test]
    fn default_channel_update() {
        let mut cal = calendar();
        cal.update_default_channel(ChannelId::new(42));
        assert_eq!(cal.default_channel, Some(ChannelId::new(42)));
    }
}
