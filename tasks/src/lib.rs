//! Task line grammar library: one task per Markdown list line.
//! Nothing here does I/O or reads the clock; callers pass "today" in.

pub mod status {
    //! Status registry: symbol → status, plus the toggle cycle.

    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};

    /// Broad classification of a status; drives done-date stamping and query predicates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum StatusType {
        #[default]
        Todo,
        InProgress,
        Done,
        Cancelled,
        NonTask,
    }

    impl StatusType {
        pub fn parse(s: &str) -> Option<Self> {
            match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
                "todo" => Some(Self::Todo),
                "in_progress" => Some(Self::InProgress),
                "done" => Some(Self::Done),
                "cancelled" | "canceled" => Some(Self::Cancelled),
                "non_task" => Some(Self::NonTask),
                _ => None,
            }
        }

        pub fn as_str(&self) -> &'static str {
            match self {
                Self::Todo => "TODO",
                Self::InProgress => "IN_PROGRESS",
                Self::Done => "DONE",
                Self::Cancelled => "CANCELLED",
                Self::NonTask => "NON_TASK",
            }
        }

        /// Ordering used by `sort by status`.
        pub fn sort_rank(&self) -> u8 {
            match self {
                Self::InProgress => 0,
                Self::Todo => 1,
                Self::Done => 2,
                Self::Cancelled => 3,
                Self::NonTask => 4,
            }
        }
    }

    /// A registered status. Identity is the symbol; the name is display only.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Status {
        pub symbol: char,
        pub name: String,
        pub next_symbol: char,
        #[serde(rename = "type")]
        pub kind: StatusType,
    }

    impl PartialEq for Status {
        fn eq(&self, other: &Self) -> bool {
            self.symbol == other.symbol
        }
    }

    impl Eq for Status {}

    impl Status {
        pub fn new(symbol: char, name: impl Into<String>, next_symbol: char, kind: StatusType) -> Self {
            Self {
                symbol,
                name: name.into(),
                next_symbol,
                kind,
            }
        }

        /// Fallback for symbols nobody registered. Keeps the symbol so the line renders unchanged.
        pub fn unknown(symbol: char) -> Self {
            Self::new(symbol, "Unknown", 'x', StatusType::Todo)
        }

        pub fn todo() -> Self {
            Self::new(' ', "Todo", 'x', StatusType::Todo)
        }

        pub fn done() -> Self {
            Self::new('x', "Done", ' ', StatusType::Done)
        }

        /// Done-like for toggling: entering this status stamps a done date.
        pub fn is_done(&self) -> bool {
            self.kind == StatusType::Done
        }

        /// Matches the `done` query filter.
        pub fn is_completed(&self) -> bool {
            matches!(
                self.kind,
                StatusType::Done | StatusType::Cancelled | StatusType::NonTask
            )
        }
    }

    /// Immutable once built; replace the whole registry when configuration changes.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StatusRegistry {
        statuses: IndexMap<char, Status>,
    }

    impl Default for StatusRegistry {
        fn default() -> Self {
            Self::with_statuses([
                Status::todo(),
                Status::done(),
                Status::new('/', "In Progress", 'x', StatusType::InProgress),
                Status::new('-', "Cancelled", ' ', StatusType::Cancelled),
            ])
        }
    }

    impl StatusRegistry {
        pub fn empty() -> Self {
            Self {
                statuses: IndexMap::new(),
            }
        }

        /// Later entries replace earlier ones with the same symbol.
        pub fn with_statuses(statuses: impl IntoIterator<Item = Status>) -> Self {
            let mut map = IndexMap::new();
            for status in statuses {
                map.insert(status.symbol, status);
            }
            Self { statuses: map }
        }

        /// Returns a new registry with `overrides` layered over `self`.
        pub fn layered(&self, overrides: impl IntoIterator<Item = Status>) -> Self {
            let mut statuses = self.statuses.clone();
            for status in overrides {
                statuses.insert(status.symbol, status);
            }
            Self { statuses }
        }

        /// Never fails: unregistered symbols resolve to [`Status::unknown`].
        pub fn by_symbol(&self, symbol: char) -> Status {
            self.statuses
                .get(&symbol)
                .cloned()
                .unwrap_or_else(|| Status::unknown(symbol))
        }

        pub fn next_status(&self, status: &Status) -> Status {
            self.by_symbol(status.next_symbol)
        }

        /// First registered todo-type status; used to reset recurring occurrences.
        pub fn initial(&self) -> Status {
            self.statuses
                .values()
                .find(|s| s.kind == StatusType::Todo)
                .cloned()
                .unwrap_or_else(Status::todo)
        }

        pub fn iter(&self) -> impl Iterator<Item = &Status> {
            self.statuses.values()
        }

        pub fn len(&self) -> usize {
            self.statuses.len()
        }

        pub fn is_empty(&self) -> bool {
            self.statuses.is_empty()
        }
    }

}

pub mod core {
    use crate::recurrence::Recurrence;
    use crate::status::Status;
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    /* ---------------------------- Value Objects ---------------------------- */

    /// Ordinal priority; 1 is highest. Absence is modelled as `Option::None`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum Priority {
        Highest = 1,
        High = 2,
        Medium = 3,
        Low = 4,
        Lowest = 5,
    }

    impl Priority {
        pub const ALL: [Priority; 5] = [
            Priority::Highest,
            Priority::High,
            Priority::Medium,
            Priority::Low,
            Priority::Lowest,
        ];

        pub fn ordinal(self) -> u8 {
            self as u8
        }

        pub fn marker(self) -> &'static str {
            match self {
                Self::Highest => "🔺",
                Self::High => "⏫",
                Self::Medium => "🔼",
                Self::Low => "🔽",
                Self::Lowest => "⏬",
            }
        }

        /// Accepts the marker with or without a trailing variation selector.
        pub fn from_marker(word: &str) -> Option<Self> {
            let bare = word.strip_suffix('\u{FE0F}').unwrap_or(word);
            Self::ALL.into_iter().find(|p| p.marker() == bare)
        }

        pub fn name(self) -> &'static str {
            match self {
                Self::Highest => "Highest",
                Self::High => "High",
                Self::Medium => "Medium",
                Self::Low => "Low",
                Self::Lowest => "Lowest",
            }
        }

        pub fn from_name(name: &str) -> Option<Self> {
            Self::ALL
                .into_iter()
                .find(|p| p.name().eq_ignore_ascii_case(name.trim()))
        }
    }

    /// Comparison rank for sorting and filtering; "no priority" sits between medium and low.
    pub fn priority_rank(priority: Option<Priority>) -> u8 {
        match priority {
            Some(p) => p.ordinal() * 2,
            None => 7,
        }
    }

    /// Where a task line lives. A back-reference used to relocate the line on rewrite.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TaskLocation {
        pub path: String,
        /// Zero-based line number in the document.
        pub line_number: usize,
        /// Line of the heading that opens this section (0 before any heading).
        pub section_start: usize,
        /// Index of the task within its section; unique per `section_start`.
        pub section_index: usize,
        pub preceding_header: Option<String>,
    }

    impl TaskLocation {
        pub fn new(path: impl Into<String>) -> Self {
            Self {
                path: path.into(),
                ..Self::default()
            }
        }

        pub fn file_name(&self) -> &str {
            self.path.rsplit(['/', '\\']).next().unwrap_or(&self.path)
        }

        /// Folder part of the path including the trailing separator, `/` for top-level files.
        pub fn folder(&self) -> String {
            match self.path.rfind(['/', '\\']) {
                Some(pos) => self.path[..=pos].to_string(),
                None => "/".to_string(),
            }
        }
    }

    /// Which structured date a predicate, sorter or grouper looks at.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum DateField {
        Start,
        Scheduled,
        Due,
        Done,
    }

    impl DateField {
        pub fn name(self) -> &'static str {
            match self {
                Self::Start => "start",
                Self::Scheduled => "scheduled",
                Self::Due => "due",
                Self::Done => "done",
            }
        }

        pub fn from_name(name: &str) -> Option<Self> {
            match name {
                "start" | "starts" => Some(Self::Start),
                "scheduled" => Some(Self::Scheduled),
                "due" => Some(Self::Due),
                "done" => Some(Self::Done),
                _ => None,
            }
        }

        pub fn get(self, task: &Task) -> Option<NaiveDate> {
            match self {
                Self::Start => task.start_date,
                Self::Scheduled => task.scheduled_date,
                Self::Due => task.due_date,
                Self::Done => task.done_date,
            }
        }
    }

    /// Outcome of classifying a single line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum LineKind {
        Task,
        ChecklistItem,
        ListItem,
        PlainText,
    }

    /* ------------------------------- Entity ------------------------------- */

    /// One task parsed from (or destined for) exactly one line of text.
    ///
    /// Value object: edits produce new records, see [`crate::toggle::toggle_task`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub location: TaskLocation,
        pub status: Status,
        /// Free text with tags and recognized fields removed.
        pub description: String,
        /// Ordered, de-duplicated, each beginning with `#`.
        #[serde(default)]
        pub tags: Vec<String>,
        /// Per tag, how many description words precede it on the line. Missing entries
        /// render after the description.
        #[serde(default)]
        pub tag_offsets: Vec<usize>,
        pub original_markdown: String,
        pub indentation: String,
        pub list_marker: String,
        pub block_link: Option<String>,
        pub priority: Option<Priority>,
        pub start_date: Option<NaiveDate>,
        pub scheduled_date: Option<NaiveDate>,
        /// Scheduled date came from the document path, not the line.
        #[serde(default)]
        pub scheduled_date_is_inferred: bool,
        pub due_date: Option<NaiveDate>,
        pub done_date: Option<NaiveDate>,
        pub recurrence: Option<Recurrence>,
        pub estimated_minutes: Option<u32>,
    }

    impl Task {
        pub fn is_done(&self) -> bool {
            self.status.is_done()
        }

        pub fn is_recurring(&self) -> bool {
            self.recurrence.is_some()
        }

        /// Earliest of start, scheduled and due.
        pub fn happens(&self) -> Option<NaiveDate> {
            [self.start_date, self.scheduled_date, self.due_date]
                .into_iter()
                .flatten()
                .min()
        }

        pub fn has_explicit_dates(&self) -> bool {
            self.start_date.is_some()
                || self.due_date.is_some()
                || (self.scheduled_date.is_some() && !self.scheduled_date_is_inferred)
        }

        /// Structured equality: everything except location and the verbatim source line.
        pub fn same_fields(&self, other: &Task) -> bool {
            self.status == other.status
                && self.description == other.description
                && self.tags == other.tags
                && self.tag_offsets == other.tag_offsets
                && self.indentation == other.indentation
                && self.list_marker == other.list_marker
                && self.block_link == other.block_link
                && self.priority == other.priority
                && self.start_date == other.start_date
                && self.scheduled_date == other.scheduled_date
                && self.due_date == other.due_date
                && self.done_date == other.done_date
                && self.recurrence == other.recurrence
                && self.estimated_minutes == other.estimated_minutes
        }

        /// Explicit edit of the scheduled date; an explicit date is never inferred.
        pub fn with_scheduled_date(mut self, date: Option<NaiveDate>) -> Self {
            self.scheduled_date = date;
            self.scheduled_date_is_inferred = false;
            self
        }

        pub fn with_start_date(mut self, date: Option<NaiveDate>) -> Self {
            self.start_date = date;
            self.clear_inferred_if_explicit(date);
            self
        }

        pub fn with_due_date(mut self, date: Option<NaiveDate>) -> Self {
            self.due_date = date;
            self.clear_inferred_if_explicit(date);
            self
        }

        fn clear_inferred_if_explicit(&mut self, date: Option<NaiveDate>) {
            if date.is_some() && self.scheduled_date_is_inferred {
                self.scheduled_date = None;
                self.scheduled_date_is_inferred = false;
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::status::Status;

        fn blank() -> Task {
            Task {
                location: TaskLocation::new("daily/2024-03-01.md"),
                status: Status::todo(),
                description: "x".into(),
                tags: vec![],
                tag_offsets: vec![],
                original_markdown: "- [ ] x".into(),
                indentation: String::new(),
                list_marker: "-".into(),
                block_link: None,
                priority: None,
                start_date: None,
                scheduled_date: NaiveDate::from_ymd_opt(2024, 3, 1),
                scheduled_date_is_inferred: true,
                due_date: None,
                done_date: None,
                recurrence: None,
                estimated_minutes: None,
            }
        }

        #[test]
        fn no_priority_ranks_between_medium_and_low() {
            assert!(priority_rank(Some(Priority::Medium)) < priority_rank(None));
            assert!(priority_rank(None) < priority_rank(Some(Priority::Low)));
        }

        #[test]
        fn location_helpers() {
            let loc = TaskLocation::new("work/notes/todo.md");
            assert_eq!(loc.file_name(), "todo.md");
            assert_eq!(loc.folder(), "work/notes/");
            assert_eq!(TaskLocation::new("root.md").folder(), "/");
        }

        #[test]
        fn explicit_date_edit_clears_inferred_schedule() {
            let task = blank().with_due_date(NaiveDate::from_ymd_opt(2024, 3, 5));
            assert_eq!(task.scheduled_date, None);
            assert!(!task.scheduled_date_is_inferred);

            let task = blank().with_scheduled_date(NaiveDate::from_ymd_opt(2024, 4, 1));
            assert!(!task.scheduled_date_is_inferred);
            assert!(task.has_explicit_dates());
        }

        #[test]
        fn happens_is_earliest_date() {
            let mut task = blank();
            task.due_date = NaiveDate::from_ymd_opt(2024, 2, 1);
            assert_eq!(task.happens(), NaiveDate::from_ymd_opt(2024, 2, 1));
        }
    }
}

pub mod recurrence {
    //! Recurrence rules (`every 2 weeks on Monday`, `every month on the last Friday`, ...)
    //! and next-occurrence computation.
    //!
    //! Monthly and yearly rules step from the anchor in whole months and clamp to the
    //! month length, so Jan 31 → Feb 29 → (from Feb 29) Mar 29; no month is ever skipped.

    use chrono::{Datelike, Duration, Months, NaiveDate, Weekday};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while1},
        character::complete::{digit1, space0, space1},
        combinator::{all_consuming, map, map_opt, map_res, opt, verify},
        error::VerboseError,
        multi::separated_list1,
        sequence::{preceded, terminated, tuple},
    };
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum RecurrenceParseError {
        #[error("recurrence rule is empty")]
        Empty,
        #[error("unrecognized recurrence rule {0:?}")]
        Unrecognized(String),
        #[error("recurrence interval must be at least 1")]
        ZeroInterval,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Frequency {
        Daily,
        /// Empty `days` steps whole weeks from the anchor.
        Weekly { days: Vec<Weekday> },
        Monthly { on: MonthlyOn },
        Yearly,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum MonthlyOn {
        SameDay,
        Day(u32),
        LastDay,
        /// `nth` is 1..=5, or -1 for the last such weekday.
        Weekday { nth: i8, weekday: Weekday },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RecurrenceRule {
        pub interval: u32,
        pub frequency: Frequency,
        /// Anchor on the completion date instead of the task's reference date.
        pub when_done: bool,
    }

    impl std::str::FromStr for RecurrenceRule {
        type Err = RecurrenceParseError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::parse(s)
        }
    }

    impl RecurrenceRule {
        pub fn parse(text: &str) -> Result<Self, RecurrenceParseError> {
            let lower = text.trim().to_lowercase();
            if lower.is_empty() {
                return Err(RecurrenceParseError::Empty);
            }
            let rule = match all_consuming(parse_rule)(lower.as_str()) {
                Ok((_, rule)) => rule,
                Err(_) => return Err(RecurrenceParseError::Unrecognized(text.trim().to_string())),
            };
            if rule.interval == 0 {
                return Err(RecurrenceParseError::ZeroInterval);
            }
            Ok(rule)
        }

        /// First occurrence strictly after `after`, stepping from `anchor`.
        pub fn next_after(&self, anchor: NaiveDate, after: NaiveDate) -> Option<NaiveDate> {
            let interval = self.interval.max(1);
            match &self.frequency {
                Frequency::Daily => step_days(anchor, after, i64::from(interval)),
                Frequency::Weekly { days } if days.is_empty() => {
                    step_days(anchor, after, 7 * i64::from(interval))
                }
                Frequency::Weekly { days } => next_weekday_in_cadence(anchor, after, days, interval),
                Frequency::Monthly { on } => step_months(anchor, after, interval, on),
                Frequency::Yearly => {
                    step_months(anchor, after, interval.checked_mul(12)?, &MonthlyOn::SameDay)
                }
            }
        }
    }

    /// The dates that move when a task recurs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Occurrence {
        pub start_date: Option<NaiveDate>,
        pub scheduled_date: Option<NaiveDate>,
        pub due_date: Option<NaiveDate>,
    }

    impl Occurrence {
        /// Due, then scheduled, then start.
        pub fn reference_date(&self) -> Option<NaiveDate> {
            self.due_date.or(self.scheduled_date).or(self.start_date)
        }
    }

    /// A rule as written on the line plus the date it is anchored to.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Recurrence {
        /// Rule text verbatim (trimmed), rendered back unchanged.
        pub text: String,
        pub rule: RecurrenceRule,
        pub reference_date: Option<NaiveDate>,
    }

    impl Recurrence {
        pub fn resolve(
            text: &str,
            start_date: Option<NaiveDate>,
            scheduled_date: Option<NaiveDate>,
            due_date: Option<NaiveDate>,
        ) -> Result<Self, RecurrenceParseError> {
            let rule = RecurrenceRule::parse(text)?;
            let dates = Occurrence {
                start_date,
                scheduled_date,
                due_date,
            };
            Ok(Self {
                text: text.trim().to_string(),
                rule,
                reference_date: dates.reference_date(),
            })
        }

        /// Next occurrence of the reference date strictly after `after`.
        pub fn next(&self, after: NaiveDate) -> Option<NaiveDate> {
            let anchor = self.reference_date?;
            self.rule.next_after(anchor, after)
        }

        /// Dates for the following occurrence; `None` while no reference date exists.
        ///
        /// Every present field moves by the same number of days as the reference date.
        pub fn next_occurrence(&self, current: Occurrence, today: NaiveDate) -> Option<Occurrence> {
            let reference = self.reference_date?;
            let next_reference = if self.rule.when_done {
                self.rule.next_after(today, today)?
            } else {
                self.rule.next_after(reference, reference)?
            };
            let shift = Duration::days((next_reference - reference).num_days());
            let move_date = |d: Option<NaiveDate>| d.and_then(|d| d.checked_add_signed(shift));
            Some(Occurrence {
                start_date: move_date(current.start_date),
                scheduled_date: move_date(current.scheduled_date),
                due_date: move_date(current.due_date),
            })
        }

        /// Same rule re-anchored on the given dates.
        pub fn rebased(&self, dates: &Occurrence) -> Self {
            Self {
                text: self.text.clone(),
                rule: self.rule.clone(),
                reference_date: dates.reference_date(),
            }
        }
    }

    /* ------------------------------ Stepping ------------------------------ */

    fn step_days(anchor: NaiveDate, after: NaiveDate, step: i64) -> Option<NaiveDate> {
        let elapsed = (after - anchor).num_days();
        let steps = if elapsed < 0 { 1 } else { elapsed / step + 1 };
        anchor.checked_add_signed(Duration::try_days(steps.checked_mul(step)?)?)
    }

    fn week_start(d: NaiveDate) -> NaiveDate {
        d - Duration::days(i64::from(d.weekday().num_days_from_monday()))
    }

    /// Only weeks `interval`, `2 * interval`, ... after the anchor's week are eligible.
    /// At most two eligible weeks need scanning: the one holding `after + 1` (or the last
    /// one before it) and the next.
    fn next_weekday_in_cadence(
        anchor: NaiveDate,
        after: NaiveDate,
        days: &[Weekday],
        interval: u32,
    ) -> Option<NaiveDate> {
        let anchor_week = week_start(anchor);
        let interval = i64::from(interval);
        let start = after.succ_opt()?;
        let elapsed = (week_start(start) - anchor_week).num_days().div_euclid(7);
        let mut week = elapsed.div_euclid(interval).checked_mul(interval)?;
        for _ in 0..2 {
            let monday = anchor_week.checked_add_signed(Duration::try_weeks(week)?)?;
            for offset in 0..7 {
                let day = monday.checked_add_signed(Duration::days(offset))?;
                if day >= start && days.contains(&day.weekday()) {
                    return Some(day);
                }
            }
            week = week.checked_add(interval)?;
        }
        None
    }

    fn step_months(anchor: NaiveDate, after: NaiveDate, step: u32, on: &MonthlyOn) -> Option<NaiveDate> {
        let elapsed = (after.year() - anchor.year()) * 12 + after.month() as i32 - anchor.month() as i32;
        let mut k = (elapsed.max(0) as u32 / step).saturating_sub(1);
        // a fifth weekday can be missing for a few consecutive months; 64 steps always finds one
        for _ in 0..64 {
            if let Some(candidate) = month_candidate(anchor, k.checked_mul(step)?, on) {
                if candidate > after {
                    return Some(candidate);
                }
            }
            k += 1;
        }
        None
    }

    fn month_candidate(anchor: NaiveDate, offset: u32, on: &MonthlyOn) -> Option<NaiveDate> {
        let first = NaiveDate::from_ymd_opt(anchor.year(), anchor.month(), 1)?
            .checked_add_months(Months::new(offset))?;
        let dim = days_in_month(first)?;
        match on {
            MonthlyOn::SameDay => first.with_day(anchor.day().min(dim)),
            MonthlyOn::Day(day) => first.with_day((*day).min(dim)),
            MonthlyOn::LastDay => first.with_day(dim),
            MonthlyOn::Weekday { nth, weekday } => nth_weekday(first, dim, *nth, *weekday),
        }
    }

    fn days_in_month(first: NaiveDate) -> Option<u32> {
        Some(first.checked_add_months(Months::new(1))?.pred_opt()?.day())
    }

    fn nth_weekday(first: NaiveDate, dim: u32, nth: i8, weekday: Weekday) -> Option<NaiveDate> {
        if nth > 0 {
            let lead = (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
            let day = 1 + lead + (nth as u32 - 1) * 7;
            if day <= dim { first.with_day(day) } else { None }
        } else {
            let last = first.with_day(dim)?;
            let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
            last.with_day(dim - back)
        }
    }

    /* ------------------------------- Grammar ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    const WORKDAYS: [Weekday; 5] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ];

    #[derive(Clone, Copy)]
    enum Unit {
        Day,
        Week,
        Month,
        Year,
    }

    fn parse_rule(i: &str) -> PResult<'_, RecurrenceRule> {
        let (i, _) = tag("every")(i)?;
        let (i, _) = space1(i)?;
        let (i, (interval, frequency)) = alt((weekday_rule, unit_rule))(i)?;
        let (i, when_done) = map(opt(preceded(space1, tag("when done"))), |o| o.is_some())(i)?;
        let (i, _) = space0(i)?;
        Ok((
            i,
            RecurrenceRule {
                interval,
                frequency,
                when_done,
            },
        ))
    }

    fn word(i: &str) -> PResult<'_, &str> {
        take_while1(|c: char| c.is_alphabetic())(i)
    }

    fn weekday_rule(i: &str) -> PResult<'_, (u32, Frequency)> {
        alt((
            map(verify(word, |w: &str| w == "weekday"), |_| {
                (
                    1,
                    Frequency::Weekly {
                        days: WORKDAYS.to_vec(),
                    },
                )
            }),
            map(weekday_list, |days| (1, Frequency::Weekly { days })),
        ))(i)
    }

    fn unit_rule(i: &str) -> PResult<'_, (u32, Frequency)> {
        let (i, interval) = opt(terminated(interval_number, space1))(i)?;
        let interval = interval.unwrap_or(1);
        let (i, unit) = map_opt(word, unit_from_word)(i)?;
        match unit {
            Unit::Day => Ok((i, (interval, Frequency::Daily))),
            Unit::Week => {
                let (i, days) = opt(preceded(tuple((space1, tag("on"), space1)), weekday_list))(i)?;
                Ok((
                    i,
                    (
                        interval,
                        Frequency::Weekly {
                            days: days.unwrap_or_default(),
                        },
                    ),
                ))
            }
            Unit::Month => {
                let (i, on) = opt(preceded(
                    tuple((space1, tag("on"), space1, tag("the"), space1)),
                    monthly_on,
                ))(i)?;
                Ok((
                    i,
                    (
                        interval,
                        Frequency::Monthly {
                            on: on.unwrap_or(MonthlyOn::SameDay),
                        },
                    ),
                ))
            }
            Unit::Year => Ok((i, (interval, Frequency::Yearly))),
        }
    }

    fn interval_number(i: &str) -> PResult<'_, u32> {
        alt((
            map_res(digit1, |s: &str| s.parse::<u32>()),
            map(verify(word, |w: &str| w == "other"), |_| 2),
        ))(i)
    }

    fn unit_from_word(w: &str) -> Option<Unit> {
        match w {
            "day" | "days" => Some(Unit::Day),
            "week" | "weeks" => Some(Unit::Week),
            "month" | "months" => Some(Unit::Month),
            "year" | "years" => Some(Unit::Year),
            _ => None,
        }
    }

    fn weekday(i: &str) -> PResult<'_, Weekday> {
        map_opt(word, weekday_from_name)(i)
    }

    fn weekday_from_name(w: &str) -> Option<Weekday> {
        let w = w.strip_suffix('s').filter(|s| s.ends_with("day")).unwrap_or(w);
        match w {
            "monday" | "mon" => Some(Weekday::Mon),
            "tuesday" | "tue" | "tues" => Some(Weekday::Tue),
            "wednesday" | "wed" => Some(Weekday::Wed),
            "thursday" | "thu" | "thurs" => Some(Weekday::Thu),
            "friday" | "fri" => Some(Weekday::Fri),
            "saturday" | "sat" => Some(Weekday::Sat),
            "sunday" | "sun" => Some(Weekday::Sun),
            _ => None,
        }
    }

    fn weekday_list(i: &str) -> PResult<'_, Vec<Weekday>> {
        separated_list1(
            alt((tag(", and "), tag(" and "), tag(", "), tag(","))),
            weekday,
        )(i)
    }

    fn ordinal(i: &str) -> PResult<'_, u32> {
        terminated(
            map_res(digit1, |s: &str| s.parse::<u32>()),
            alt((tag("st"), tag("nd"), tag("rd"), tag("th"))),
        )(i)
    }

    fn monthly_on(i: &str) -> PResult<'_, MonthlyOn> {
        alt((
            map(tuple((tag("last"), space1, weekday)), |(_, _, weekday)| {
                MonthlyOn::Weekday { nth: -1, weekday }
            }),
            map(tag("last"), |_| MonthlyOn::LastDay),
            map(
                tuple((verify(ordinal, |n: &u32| (1..=5).contains(n)), space1, weekday)),
                |(nth, _, weekday)| MonthlyOn::Weekday {
                    nth: nth as i8,
                    weekday,
                },
            ),
            map(verify(ordinal, |n: &u32| (1..=31).contains(n)), MonthlyOn::Day),
        ))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        #[test]
        fn parses_common_phrases() {
            let r = RecurrenceRule::parse("every 2 weeks").unwrap();
            assert_eq!(r.interval, 2);
            assert_eq!(r.frequency, Frequency::Weekly { days: vec![] });

            let r = RecurrenceRule::parse("Every Monday").unwrap();
            assert_eq!(r.frequency, Frequency::Weekly { days: vec![Weekday::Mon] });

            let r = RecurrenceRule::parse("every week on Monday, Wednesday and Friday").unwrap();
            assert_eq!(
                r.frequency,
                Frequency::Weekly {
                    days: vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]
                }
            );

            let r = RecurrenceRule::parse("every month on the last Friday when done").unwrap();
            assert!(r.when_done);
            assert_eq!(
                r.frequency,
                Frequency::Monthly {
                    on: MonthlyOn::Weekday {
                        nth: -1,
                        weekday: Weekday::Fri
                    }
                }
            );

            let r = RecurrenceRule::parse("every other day").unwrap();
            assert_eq!((r.interval, r.frequency), (2, Frequency::Daily));
        }

        #[test]
        fn month_is_not_mistaken_for_monday() {
            let r = RecurrenceRule::parse("every month").unwrap();
            assert_eq!(r.frequency, Frequency::Monthly { on: MonthlyOn::SameDay });
        }

        #[test]
        fn rejects_garbage_and_zero_interval() {
            assert!(matches!(
                RecurrenceRule::parse("whenever I feel like it"),
                Err(RecurrenceParseError::Unrecognized(_))
            ));
            assert_eq!(RecurrenceRule::parse("  "), Err(RecurrenceParseError::Empty));
            assert_eq!(
                RecurrenceRule::parse("every 0 days"),
                Err(RecurrenceParseError::ZeroInterval)
            );
        }

        #[test]
        fn monthly_clamps_to_month_end() {
            let r = RecurrenceRule::parse("every month").unwrap();
            assert_eq!(r.next_after(d(2024, 1, 31), d(2024, 1, 31)), Some(d(2024, 2, 29)));
            assert_eq!(r.next_after(d(2023, 1, 31), d(2023, 1, 31)), Some(d(2023, 2, 28)));
        }

        #[test]
        fn yearly_from_leap_day() {
            let r = RecurrenceRule::parse("every year").unwrap();
            assert_eq!(r.next_after(d(2024, 2, 29), d(2024, 2, 29)), Some(d(2025, 2, 28)));
        }

        #[test]
        fn weekly_days_with_interval() {
            let r = RecurrenceRule::parse("every 2 weeks on Monday").unwrap();
            // 2024-01-01 is a Monday
            assert_eq!(r.next_after(d(2024, 1, 1), d(2024, 1, 1)), Some(d(2024, 1, 15)));
            let r = RecurrenceRule::parse("every weekday").unwrap();
            // Friday → Monday
            assert_eq!(r.next_after(d(2024, 1, 5), d(2024, 1, 5)), Some(d(2024, 1, 8)));
        }

        #[test]
        fn nth_and_last_weekday_of_month() {
            let r = RecurrenceRule::parse("every month on the 2nd tuesday").unwrap();
            assert_eq!(r.next_after(d(2024, 1, 9), d(2024, 1, 9)), Some(d(2024, 2, 13)));
            let r = RecurrenceRule::parse("every month on the last").unwrap();
            assert_eq!(r.next_after(d(2024, 1, 31), d(2024, 1, 31)), Some(d(2024, 2, 29)));
            let r = RecurrenceRule::parse("every month on the 15th").unwrap();
            assert_eq!(r.next_after(d(2024, 1, 5), d(2024, 1, 5)), Some(d(2024, 1, 15)));
        }

        #[test]
        fn huge_intervals_have_no_next_date() {
            let jan1 = d(2024, 1, 1);
            for text in [
                "every 400000000 years",
                "every 100000000 months",
                "every 4000000000 days",
                "every 1000000000 weeks on monday",
                "every 4000000000 weeks",
            ] {
                let r = RecurrenceRule::parse(text).unwrap();
                assert_eq!(r.next_after(jan1, jan1), None, "{text}");
            }
        }

        #[test]
        fn weekly_cadence_scans_from_before_the_anchor() {
            let r = RecurrenceRule::parse("every 3 weeks on tuesday, thursday").unwrap();
            // anchor week starts Mon 2024-01-15; eligible weeks: Jan 15, Feb 5, ...
            assert_eq!(r.next_after(d(2024, 1, 15), d(2024, 1, 1)), Some(d(2024, 1, 16)));
            assert_eq!(r.next_after(d(2024, 1, 15), d(2024, 1, 18)), Some(d(2024, 2, 6)));
            assert_eq!(r.next_after(d(2024, 1, 15), d(2024, 1, 25)), Some(d(2024, 2, 6)));
        }

        #[test]
        fn next_is_strictly_after() {
            let r = RecurrenceRule::parse("every 3 days").unwrap();
            assert_eq!(r.next_after(d(2024, 1, 1), d(2024, 1, 7)), Some(d(2024, 1, 10)));
        }

        #[test]
        fn occurrence_shifts_every_present_field() {
            let rec = Recurrence::resolve(
                "every week",
                Some(d(2024, 1, 1)),
                None,
                Some(d(2024, 1, 3)),
            )
            .unwrap();
            assert_eq!(rec.reference_date, Some(d(2024, 1, 3)));
            let next = rec
                .next_occurrence(
                    Occurrence {
                        start_date: Some(d(2024, 1, 1)),
                        scheduled_date: None,
                        due_date: Some(d(2024, 1, 3)),
                    },
                    d(2024, 1, 2),
                )
                .unwrap();
            assert_eq!(next.start_date, Some(d(2024, 1, 8)));
            assert_eq!(next.scheduled_date, None);
            assert_eq!(next.due_date, Some(d(2024, 1, 10)));
        }

        #[test]
        fn when_done_anchors_on_completion() {
            let rec = Recurrence::resolve("every 2 days when done", None, None, Some(d(2024, 1, 1))).unwrap();
            let next = rec
                .next_occurrence(
                    Occurrence {
                        due_date: Some(d(2024, 1, 1)),
                        ..Occurrence::default()
                    },
                    d(2024, 1, 10),
                )
                .unwrap();
            assert_eq!(next.due_date, Some(d(2024, 1, 12)));
        }

        #[test]
        fn no_reference_date_means_no_occurrence() {
            let rec = Recurrence::resolve("every day", None, None, None).unwrap();
            assert_eq!(rec.next(d(2024, 1, 1)), None);
            assert!(rec.next_occurrence(Occurrence::default(), d(2024, 1, 1)).is_none());
        }
    }
}

pub mod parser {
    //! Line grammar built on `nom`.
    //!
    //! Parsing strategy:
    //! - The fixed prefix (indentation, list marker, status box) is parsed with combinators,
    //!   and the same typed captures drive the textual fallback toggles.
    //! - The body is scanned word by word, left to right; each word is tried as a field
    //!   (date, priority, estimate, recurrence, tag, trailing block link) and otherwise kept
    //!   as description text. Runs of adjacent description words keep their spacing.

    use crate::core::*;
    use crate::recurrence::Recurrence;
    use crate::status::StatusRegistry;
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{take_while, take_while_m_n},
        character::complete::{anychar, char, digit1, one_of, space0, space1},
        combinator::{all_consuming, eof, map_res, opt, recognize, verify},
        error::VerboseError,
        multi::many1_count,
        sequence::{pair, terminated, tuple},
    };
    use tracing::{debug, trace};

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    pub const START_MARKERS: &[&str] = &["🛫"];
    pub const SCHEDULED_MARKERS: &[&str] = &["⏳", "⌛"];
    pub const DUE_MARKERS: &[&str] = &["📅", "📆", "🗓"];
    pub const DONE_MARKERS: &[&str] = &["✅"];
    pub const RECURRENCE_MARKERS: &[&str] = &["🔁"];
    pub const ESTIMATE_MARKERS: &[&str] = &["⏱"];

    /* ------------------------- Date fallback seam ------------------------- */

    /// Path → date heuristic used when a line carries no start/scheduled/due date.
    pub trait DateFallback {
        fn date_from_path(&self, path: &str) -> Option<NaiveDate>;
    }

    /// Never infers a date.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoDateFallback;

    impl DateFallback for NoDateFallback {
        fn date_from_path(&self, _path: &str) -> Option<NaiveDate> {
            None
        }
    }

    /// Reads `YYYY-MM-DD` or `YYYYMMDD` from the file stem, then from parent folders
    /// (nearest first). A non-empty `folders` list restricts inference to those folders.
    #[derive(Debug, Clone, Default)]
    pub struct FileNameDateFallback {
        pub folders: Vec<String>,
    }

    impl DateFallback for FileNameDateFallback {
        fn date_from_path(&self, path: &str) -> Option<NaiveDate> {
            let normalized = path.replace('\\', "/");
            if !self.folders.is_empty() && !self.folders.iter().any(|f| in_folder(&normalized, f)) {
                return None;
            }
            let mut segments: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
            let file = segments.pop()?;
            let stem = file.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(file);
            std::iter::once(stem)
                .chain(segments.into_iter().rev())
                .find_map(find_date_in)
        }
    }

    fn in_folder(path: &str, folder: &str) -> bool {
        let folder = folder.trim_matches('/');
        folder.is_empty()
            || path.starts_with(&format!("{folder}/"))
            || path.contains(&format!("/{folder}/"))
    }

    fn find_date_in(segment: &str) -> Option<NaiveDate> {
        let mut prev_digit = false;
        for (idx, c) in segment.char_indices() {
            if !prev_digit {
                if let Ok((after, date)) = alt((iso_date, compact_date))(&segment[idx..]) {
                    if !after.starts_with(|c: char| c.is_ascii_digit()) {
                        return Some(date);
                    }
                }
            }
            prev_digit = c.is_ascii_digit();
        }
        None
    }

    /// Everything a line parse depends on besides the line itself.
    ///
    /// Holds references only; statuses are re-resolved on every call.
    #[derive(Clone, Copy)]
    pub struct ParseContext<'a> {
        pub statuses: &'a StatusRegistry,
        pub date_fallback: &'a dyn DateFallback,
    }

    impl<'a> ParseContext<'a> {
        pub fn new(statuses: &'a StatusRegistry) -> Self {
            Self {
                statuses,
                date_fallback: &NoDateFallback,
            }
        }

        pub fn with_date_fallback(self, date_fallback: &'a dyn DateFallback) -> Self {
            Self {
                date_fallback,
                ..self
            }
        }
    }

    /* --------------------------- Line prefixes --------------------------- */

    /// `<indent><marker>` at the start of a list line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ListPrefix<'a> {
        pub indentation: &'a str,
        pub marker: &'a str,
        /// Byte length of indentation, marker and the separating whitespace.
        pub len: usize,
    }

    /// `<indent><marker> [<symbol>]<body>`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChecklistLine<'a> {
        pub indentation: &'a str,
        pub marker: &'a str,
        pub symbol: char,
        /// Byte offset of the status symbol inside the line.
        pub symbol_offset: usize,
        pub body: &'a str,
    }

    fn indentation(i: &str) -> PResult<'_, &str> {
        take_while(|c: char| c == ' ' || c == '\t' || c == '>')(i)
    }

    fn list_marker(i: &str) -> PResult<'_, &str> {
        alt((recognize(one_of("-*+")), recognize(pair(digit1, one_of(".)")))))(i)
    }

    pub fn parse_list_prefix(line: &str) -> Option<ListPrefix<'_>> {
        let parsed: PResult<'_, (&str, &str)> = tuple((indentation, list_marker))(line);
        let (rest, (indentation, marker)) = parsed.ok()?;
        let spaced: PResult<'_, &str> = alt((space1, eof))(rest);
        let (rest, _) = spaced.ok()?;
        Some(ListPrefix {
            indentation,
            marker,
            len: line.len() - rest.len(),
        })
    }

    pub fn parse_checklist(line: &str) -> Option<ChecklistLine<'_>> {
        let parsed: PResult<'_, (&str, &str, &str, char)> = tuple((
            indentation,
            list_marker,
            space1,
            char('['),
        ))(line);
        let (after_open, (indentation, marker, _, _)) = parsed.ok()?;
        let symbol_offset = line.len() - after_open.len();
        let boxed: PResult<'_, char> =
            terminated(verify(anychar, |c: &char| *c != '\n' && *c != '\r'), char(']'))(after_open);
        let (rest, symbol) = boxed.ok()?;
        let (body, _) = space0::<_, VerboseError<&str>>(rest).ok()?;
        Some(ChecklistLine {
            indentation,
            marker,
            symbol,
            symbol_offset,
            body,
        })
    }

    /// Fallback classification without building a record.
    pub fn classify_line(line: &str) -> LineKind {
        match parse_checklist(line) {
            Some(c) if !c.body.trim().is_empty() => LineKind::Task,
            Some(_) => LineKind::ChecklistItem,
            None if parse_list_prefix(line).is_some() => LineKind::ListItem,
            None => LineKind::PlainText,
        }
    }

    /// Leading indentation of any line (spaces, tabs, block quote markers).
    pub fn leading_indentation(line: &str) -> &str {
        match indentation(line) {
            Ok((_, indent)) => indent,
            Err(_) => "",
        }
    }

    /* ------------------------------- Values ------------------------------- */

    fn iso_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                take_while_m_n(4, 4, |c: char| c.is_ascii_digit()),
                char('-'),
                take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
                char('-'),
                take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
            )),
            |(y, _, m, _, d): (&str, char, &str, char, &str)| ymd(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn compact_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                take_while_m_n(4, 4, |c: char| c.is_ascii_digit()),
                take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
                take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
            )),
            |(y, m, d): (&str, &str, &str)| ymd(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn ymd(y: &str, m: &str, d: &str) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
    }

    /// A whole word that is exactly one ISO `YYYY-MM-DD` date.
    pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
        all_consuming(iso_date)(s).ok().map(|(_, d)| d)
    }

    /// `90m`, `2h`, `1h30m` → minutes.
    pub fn parse_estimate(s: &str) -> Option<u32> {
        let parsed: PResult<'_, (Option<&str>, Option<&str>)> = all_consuming(pair(
            opt(terminated(digit1, char('h'))),
            opt(terminated(digit1, char('m'))),
        ))(s);
        match parsed.ok()?.1 {
            (None, None) => None,
            (h, m) => {
                let hours: u32 = h.map_or(Some(0), |h| h.parse().ok())?;
                let minutes: u32 = m.map_or(Some(0), |m| m.parse().ok())?;
                hours.checked_mul(60)?.checked_add(minutes)
            }
        }
    }

    fn strip_marker<'w>(word: &'w str, markers: &[&str]) -> Option<&'w str> {
        markers.iter().find_map(|m| {
            word.strip_prefix(m)
                .map(|rest| rest.strip_prefix('\u{FE0F}').unwrap_or(rest))
        })
    }

    fn strip_date_marker(word: &str) -> Option<(DateField, &str)> {
        [
            (DateField::Start, START_MARKERS),
            (DateField::Scheduled, SCHEDULED_MARKERS),
            (DateField::Due, DUE_MARKERS),
            (DateField::Done, DONE_MARKERS),
        ]
        .into_iter()
        .find_map(|(field, markers)| strip_marker(word, markers).map(|rest| (field, rest)))
    }

    fn tag_token(word: &str) -> Option<&str> {
        let rest = word.strip_prefix('#')?;
        let first = rest.chars().next()?;
        if first == '#' || rest.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(word)
    }

    fn block_link(word: &str) -> Option<&str> {
        let id = word.strip_prefix('^')?;
        if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            Some(word)
        } else {
            None
        }
    }

    /// True when `line` contains a done-date annotation (`✅ YYYY-MM-DD`).
    pub fn contains_done_date(line: &str) -> bool {
        let words: Vec<&str> = line.split_whitespace().collect();
        words.iter().enumerate().any(|(idx, word)| match strip_marker(word, DONE_MARKERS) {
            Some("") => words.get(idx + 1).and_then(|w| parse_iso_date(w)).is_some(),
            Some(rest) => parse_iso_date(rest).is_some(),
            None => false,
        })
    }

    /* ---------------------------- Body scanner ---------------------------- */

    #[derive(Debug, Clone, PartialEq)]
    enum TokenKind<'a> {
        Description,
        Date(DateField, NaiveDate),
        Priority(Priority),
        Estimate(u32),
        Recurrence(&'a str),
        Tag(&'a str),
        BlockLink(&'a str),
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Token<'a> {
        kind: TokenKind<'a>,
        start: usize,
        end: usize,
    }

    pub(crate) fn word_spans(body: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = None;
        for (idx, c) in body.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    spans.push((s, idx));
                    start = None;
                }
                (false, None) => start = Some(idx),
                _ => {}
            }
        }
        if let Some(s) = start {
            spans.push((s, body.len()));
        }
        spans
    }

    fn starts_field(word: &str, is_last: bool) -> bool {
        strip_date_marker(word).is_some()
            || Priority::from_marker(word).is_some()
            || strip_marker(word, ESTIMATE_MARKERS).is_some()
            || strip_marker(word, RECURRENCE_MARKERS).is_some()
            || tag_token(word).is_some()
            || (is_last && block_link(word).is_some())
    }

    /// Marker value either glued to the marker or in the following word.
    /// Returns the token, its end offset and how many words it used.
    fn valued<'a>(
        rest: &str,
        end: usize,
        next_word: Option<(&str, usize)>,
        parse: impl Fn(&str) -> Option<TokenKind<'a>>,
    ) -> Option<(TokenKind<'a>, usize, usize)> {
        if rest.is_empty() {
            next_word.and_then(|(w, e)| parse(w).map(|k| (k, e, 2)))
        } else {
            parse(rest).map(|k| (k, end, 1))
        }
    }

    fn scan_body(body: &str) -> Vec<Token<'_>> {
        let words = word_spans(body);
        let mut tokens = Vec::with_capacity(words.len());
        let mut idx = 0;
        while idx < words.len() {
            let (start, end) = words[idx];
            let word = &body[start..end];
            let is_last = idx + 1 == words.len();
            let next_word = words.get(idx + 1).map(|&(s, e)| (&body[s..e], e));

            if let Some((field, rest)) = strip_date_marker(word) {
                let parse = |w: &str| parse_iso_date(w).map(|d| TokenKind::Date(field, d));
                if let Some((kind, token_end, used)) = valued(rest, end, next_word, parse) {
                    tokens.push(Token { kind, start, end: token_end });
                    idx += used;
                    continue;
                }
            }
            if let Some(priority) = Priority::from_marker(word) {
                tokens.push(Token { kind: TokenKind::Priority(priority), start, end });
                idx += 1;
                continue;
            }
            if let Some(rest) = strip_marker(word, ESTIMATE_MARKERS) {
                let parse = |w: &str| parse_estimate(w).map(TokenKind::Estimate);
                if let Some((kind, token_end, used)) = valued(rest, end, next_word, parse) {
                    tokens.push(Token { kind, start, end: token_end });
                    idx += used;
                    continue;
                }
            }
            if let Some(rest) = strip_marker(word, RECURRENCE_MARKERS) {
                let mut stop = idx + 1;
                while stop < words.len() {
                    let (s, e) = words[stop];
                    if starts_field(&body[s..e], stop + 1 == words.len()) {
                        break;
                    }
                    stop += 1;
                }
                let value_start = if rest.is_empty() {
                    words.get(idx + 1).map(|w| w.0).filter(|_| stop > idx + 1)
                } else {
                    Some(end - rest.len())
                };
                let value_end = if stop > idx + 1 { words[stop - 1].1 } else { end };
                if let Some(value_start) = value_start {
                    tokens.push(Token {
                        kind: TokenKind::Recurrence(&body[value_start..value_end]),
                        start,
                        end: value_end,
                    });
                    idx = stop;
                    continue;
                }
            }
            if is_last {
                if let Some(link) = block_link(word) {
                    tokens.push(Token { kind: TokenKind::BlockLink(link), start, end });
                    idx += 1;
                    continue;
                }
            }
            if let Some(tag) = tag_token(word) {
                tokens.push(Token { kind: TokenKind::Tag(tag), start, end });
                idx += 1;
                continue;
            }
            tokens.push(Token { kind: TokenKind::Description, start, end });
            idx += 1;
        }
        tokens
    }

    /* ------------------------- Public entry points ------------------------- */

    /// Parse one line into a task. `None` means "not a task"; see [`classify_line`].
    pub fn parse_line(line: &str, location: &TaskLocation, ctx: &ParseContext<'_>) -> Option<Task> {
        let checklist = parse_checklist(line)?;
        let body = checklist.body.trim_end();
        if body.trim().is_empty() {
            return None;
        }
        let status = ctx.statuses.by_symbol(checklist.symbol);
        let mut tokens = scan_body(body);

        let mut start_date = None;
        let mut scheduled_date = None;
        let mut due_date = None;
        let mut done_date = None;
        let mut priority = None;
        let mut estimated_minutes = None;
        let mut block = None;
        let mut recurrence_text = None;

        for token in &tokens {
            match &token.kind {
                TokenKind::Date(DateField::Start, d) => start_date = Some(*d),
                TokenKind::Date(DateField::Scheduled, d) => scheduled_date = Some(*d),
                TokenKind::Date(DateField::Due, d) => due_date = Some(*d),
                TokenKind::Date(DateField::Done, d) => done_date = Some(*d),
                TokenKind::Priority(p) => priority = Some(*p),
                TokenKind::Estimate(m) => estimated_minutes = Some(*m),
                TokenKind::Recurrence(text) => recurrence_text = Some(*text),
                TokenKind::BlockLink(link) => block = Some(link.to_string()),
                TokenKind::Tag(_) | TokenKind::Description => {}
            }
        }

        let recurrence = recurrence_text.and_then(|text| {
            match Recurrence::resolve(text, start_date, scheduled_date, due_date) {
                Ok(rec) => Some(rec),
                Err(err) => {
                    debug!(%err, line, "keeping unparseable recurrence as description");
                    for token in tokens.iter_mut() {
                        if matches!(token.kind, TokenKind::Recurrence(_)) {
                            token.kind = TokenKind::Description;
                        }
                    }
                    None
                }
            }
        });

        let description = assemble_description(body, &tokens);
        let (tags, tag_offsets) = collect_tags(body, &tokens);

        let mut scheduled_date_is_inferred = false;
        if start_date.is_none() && scheduled_date.is_none() && due_date.is_none() {
            if let Some(date) = ctx.date_fallback.date_from_path(&location.path) {
                trace!(path = %location.path, %date, "inferred scheduled date from path");
                scheduled_date = Some(date);
                scheduled_date_is_inferred = true;
            }
        }

        Some(Task {
            location: location.clone(),
            status,
            description,
            tags,
            tag_offsets,
            original_markdown: line.to_string(),
            indentation: checklist.indentation.to_string(),
            list_marker: checklist.marker.to_string(),
            block_link: block,
            priority,
            start_date,
            scheduled_date,
            scheduled_date_is_inferred,
            due_date,
            done_date,
            recurrence,
            estimated_minutes,
        })
    }

    /// Tags in order of appearance (first occurrence wins) with the number of
    /// description words before each.
    fn collect_tags(body: &str, tokens: &[Token<'_>]) -> (Vec<String>, Vec<usize>) {
        let mut tags: Vec<String> = Vec::new();
        let mut offsets = Vec::new();
        let mut words_before = 0;
        for token in tokens {
            match token.kind {
                TokenKind::Description => {
                    words_before += body[token.start..token.end].split_whitespace().count();
                }
                TokenKind::Tag(tag) if !tags.iter().any(|t| t == tag) => {
                    tags.push(tag.to_string());
                    offsets.push(words_before);
                }
                _ => {}
            }
        }
        (tags, offsets)
    }

    fn assemble_description(body: &str, tokens: &[Token<'_>]) -> String {
        let mut out = String::new();
        let mut run: Option<(usize, usize)> = None;
        let flush = |run: &mut Option<(usize, usize)>, out: &mut String| {
            if let Some((s, e)) = run.take() {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&body[s..e]);
            }
        };
        for token in tokens {
            if token.kind == TokenKind::Description {
                run = Some(match run {
                    Some((s, _)) => (s, token.end),
                    None => (token.start, token.end),
                });
            } else {
                flush(&mut run, &mut out);
            }
        }
        flush(&mut run, &mut out);
        out.trim().to_string()
    }

    /// Move a task to a new location; an inferred scheduled date is recomputed from the new path.
    pub fn relocate(task: &Task, location: TaskLocation, fallback: &dyn DateFallback) -> Task {
        let mut moved = task.clone();
        if moved.scheduled_date_is_inferred {
            moved.scheduled_date = None;
            moved.scheduled_date_is_inferred = false;
        }
        if !moved.has_explicit_dates() {
            if let Some(date) = fallback.date_from_path(&location.path) {
                moved.scheduled_date = Some(date);
                moved.scheduled_date_is_inferred = true;
            }
        }
        moved.location = location;
        moved
    }

    /* --------------------------- Document batch --------------------------- */

    fn heading_text(line: &str) -> Option<String> {
        let parsed: PResult<'_, usize> =
            terminated(verify(many1_count(char('#')), |n: &usize| *n <= 6), space1)(line);
        let (rest, _) = parsed.ok()?;
        let text = rest.trim().trim_end_matches('#').trim_end();
        Some(text.to_string())
    }

    fn fence_marker(line: &str) -> Option<&'static str> {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            Some("```")
        } else if trimmed.starts_with("~~~") {
            Some("~~~")
        } else {
            None
        }
    }

    /// Apply the line grammar to every line, keeping order and heading association.
    pub fn parse_document(path: &str, text: &str, ctx: &ParseContext<'_>) -> Vec<Task> {
        let mut tasks = Vec::new();
        let mut header: Option<String> = None;
        let mut section_start = 0;
        let mut section_index = 0;
        let mut fence: Option<&'static str> = None;

        for (line_number, line) in text.lines().enumerate() {
            if let Some(marker) = fence_marker(line) {
                fence = match fence {
                    Some(open) if open == marker => None,
                    Some(open) => Some(open),
                    None => Some(marker),
                };
                continue;
            }
            if fence.is_some() {
                continue;
            }
            if let Some(h) = heading_text(line) {
                header = Some(h);
                section_start = line_number;
                section_index = 0;
                continue;
            }
            let location = TaskLocation {
                path: path.to_string(),
                line_number,
                section_start,
                section_index,
                preceding_header: header.clone(),
            };
            if let Some(task) = parse_line(line, &location, ctx) {
                tasks.push(task);
                section_index += 1;
            }
        }
        debug!(path, count = tasks.len(), "parsed document");
        tasks
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::status::StatusType;

        fn d(y: i32, m: u32, day: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, day).unwrap()
        }

        fn parse(line: &str) -> Option<Task> {
            let reg = StatusRegistry::default();
            parse_line(line, &TaskLocation::new("notes/inbox.md"), &ParseContext::new(&reg))
        }

        #[test]
        fn parses_every_field() {
            let t = parse("- [ ] Buy milk #shopping ⏫ 🔁 every week 📅 2024-01-15 ^abc").unwrap();
            assert_eq!(t.description, "Buy milk");
            assert_eq!(t.tags, vec!["#shopping"]);
            assert_eq!(t.priority, Some(Priority::High));
            assert_eq!(t.due_date, Some(d(2024, 1, 15)));
            assert_eq!(t.block_link.as_deref(), Some("^abc"));
            let rec = t.recurrence.unwrap();
            assert_eq!(rec.text, "every week");
            assert_eq!(rec.reference_date, Some(d(2024, 1, 15)));
            assert_eq!(t.status.symbol, ' ');
            assert!(!t.scheduled_date_is_inferred);
        }

        #[test]
        fn non_tasks_are_none() {
            assert!(parse("- [ ]   ").is_none());
            assert!(parse("- plain item").is_none());
            assert!(parse("just text").is_none());
            assert_eq!(classify_line("- [ ]"), LineKind::ChecklistItem);
            assert_eq!(classify_line("  - note"), LineKind::ListItem);
            assert_eq!(classify_line("-"), LineKind::ListItem);
            assert_eq!(classify_line("- [x] shipped"), LineKind::Task);
            assert_eq!(classify_line("-not a list"), LineKind::PlainText);
        }

        #[test]
        fn description_keeps_text_around_fields() {
            let t = parse("- [x] Call mom 📅 2024-01-02 about trip ✅ 2024-01-03").unwrap();
            assert_eq!(t.description, "Call mom about trip");
            assert_eq!(t.done_date, Some(d(2024, 1, 3)));
            assert_eq!(t.status.kind, StatusType::Done);
        }

        #[test]
        fn bad_recurrence_stays_in_description() {
            let t = parse("- [ ] Water 🔁 every blue moon").unwrap();
            assert!(t.recurrence.is_none());
            assert_eq!(t.description, "Water 🔁 every blue moon");
        }

        #[test]
        fn estimates() {
            assert_eq!(parse("- [ ] Write ⏱ 1h30m").unwrap().estimated_minutes, Some(90));
            assert_eq!(parse_estimate("45m"), Some(45));
            assert_eq!(parse_estimate("2h"), Some(120));
            assert_eq!(parse_estimate("h"), None);
            assert_eq!(parse_estimate(""), None);
        }

        #[test]
        fn tags_skip_headings_and_numbers() {
            let t = parse("- [ ] fix #123 and ##x #a #a").unwrap();
            assert_eq!(t.tags, vec!["#a"]);
            assert_eq!(t.description, "fix #123 and ##x");
        }

        #[test]
        fn variation_selector_and_prefixes() {
            let t = parse("  > * [/] nested 📅\u{FE0F} 2024-01-01").unwrap();
            assert_eq!(t.indentation, "  > ");
            assert_eq!(t.list_marker, "*");
            assert_eq!(t.due_date, Some(d(2024, 1, 1)));
            assert_eq!(t.status.kind, StatusType::InProgress);
            assert_eq!(parse("1. [ ] first").unwrap().list_marker, "1.");
        }

        #[test]
        fn unknown_symbol_is_kept() {
            let t = parse("- [?] mystery").unwrap();
            assert_eq!(t.status.symbol, '?');
            assert_eq!(t.status.name, "Unknown");
        }

        #[test]
        fn infers_scheduled_from_path() {
            let reg = StatusRegistry::default();
            let fallback = FileNameDateFallback::default();
            let ctx = ParseContext::new(&reg).with_date_fallback(&fallback);
            let loc = TaskLocation::new("daily/2024-03-05.md");

            let t = parse_line("- [ ] review", &loc, &ctx).unwrap();
            assert_eq!(t.scheduled_date, Some(d(2024, 3, 5)));
            assert!(t.scheduled_date_is_inferred);

            let t = parse_line("- [ ] review 📅 2024-04-01", &loc, &ctx).unwrap();
            assert_eq!(t.scheduled_date, None);

            let nested = TaskLocation::new("journal/20240306/notes.md");
            let t = parse_line("- [ ] review", &nested, &ctx).unwrap();
            assert_eq!(t.scheduled_date, Some(d(2024, 3, 6)));

            let only_journal = FileNameDateFallback {
                folders: vec!["journal".into()],
            };
            assert_eq!(only_journal.date_from_path("daily/2024-03-05.md"), None);
            assert_eq!(
                only_journal.date_from_path("journal/2024-03-05 standup.md"),
                Some(d(2024, 3, 5))
            );
            assert_eq!(fallback.date_from_path("notes/120240305.md"), None);
        }

        #[test]
        fn relocate_reinfers() {
            let reg = StatusRegistry::default();
            let fallback = FileNameDateFallback::default();
            let ctx = ParseContext::new(&reg).with_date_fallback(&fallback);
            let t = parse_line("- [ ] review", &TaskLocation::new("2024-03-05.md"), &ctx).unwrap();
            let moved = relocate(&t, TaskLocation::new("2024-05-01.md"), &fallback);
            assert_eq!(moved.scheduled_date, Some(d(2024, 5, 1)));
            let moved = relocate(&t, TaskLocation::new("inbox.md"), &fallback);
            assert_eq!(moved.scheduled_date, None);
            assert!(!moved.scheduled_date_is_inferred);
        }

        #[test]
        fn document_tracks_headings_and_skips_fences() {
            let text = "# Inbox\n- [ ] one\n```\n- [ ] hidden\n```\n## Later ##\n- [ ] two\n- [ ] three\n";
            let reg = StatusRegistry::default();
            let tasks = parse_document("a.md", text, &ParseContext::new(&reg));
            assert_eq!(tasks.len(), 3);
            assert_eq!(tasks[0].location.preceding_header.as_deref(), Some("Inbox"));
            assert_eq!(tasks[1].location.preceding_header.as_deref(), Some("Later"));
            assert_eq!(tasks[1].location.section_start, 5);
            assert_eq!(tasks[1].location.section_index, 0);
            assert_eq!(tasks[2].location.section_index, 1);
            assert_eq!(tasks[2].location.line_number, 7);
        }

        #[test]
        fn done_date_detection() {
            assert!(contains_done_date("- [x] a ✅ 2024-01-01"));
            assert!(contains_done_date("- [x] a ✅2024-01-01"));
            assert!(!contains_done_date("- [x] a ✅ soon"));
        }
    }
}

pub mod format {
    //! Canonical rendering. Field order is fixed so toggling never reshuffles a line
    //! beyond the fields it touches.

    use super::core::*;
    use super::parser::{
        DONE_MARKERS, DUE_MARKERS, ESTIMATE_MARKERS, RECURRENCE_MARKERS, SCHEDULED_MARKERS,
        START_MARKERS, word_spans,
    };
    use chrono::NaiveDate;

    pub fn render_task(task: &Task) -> String {
        let body = render_body(task);
        let mut out = format!(
            "{}{} [{}]",
            task.indentation, task.list_marker, task.status.symbol
        );
        if !body.is_empty() {
            out.push(' ');
            out.push_str(&body);
        }
        out
    }

    /// Everything after the status box.
    pub fn render_body(task: &Task) -> String {
        let mut parts = description_with_tags(task);
        if let Some(p) = task.priority {
            parts.push(p.marker().to_string());
        }
        if let Some(rec) = &task.recurrence {
            parts.push(format!("{} {}", RECURRENCE_MARKERS[0], rec.text));
        }
        if let Some(minutes) = task.estimated_minutes {
            parts.push(format!("{} {}", ESTIMATE_MARKERS[0], render_estimate(minutes)));
        }
        push_date(&mut parts, START_MARKERS[0], task.start_date);
        if !task.scheduled_date_is_inferred {
            push_date(&mut parts, SCHEDULED_MARKERS[0], task.scheduled_date);
        }
        push_date(&mut parts, DUE_MARKERS[0], task.due_date);
        push_date(&mut parts, DONE_MARKERS[0], task.done_date);
        if let Some(link) = &task.block_link {
            parts.push(link.clone());
        }
        parts.join(" ")
    }

    /// Description runs with each tag put back before the word it preceded.
    fn description_with_tags(task: &Task) -> Vec<String> {
        let text = task.description.as_str();
        let words = word_spans(text);
        let mut placed: Vec<(usize, &String)> = task
            .tags
            .iter()
            .enumerate()
            .map(|(idx, tag)| {
                let offset = task.tag_offsets.get(idx).copied().unwrap_or(words.len());
                (offset.min(words.len()), tag)
            })
            .collect();
        placed.sort_by_key(|(offset, _)| *offset);
        let mut tags = placed.into_iter().peekable();

        let mut parts = Vec::new();
        let mut run: Option<(usize, usize)> = None;
        for n in 0..=words.len() {
            while let Some((_, tag)) = tags.next_if(|(offset, _)| *offset == n) {
                if let Some((s, e)) = run.take() {
                    parts.push(text[s..e].to_string());
                }
                parts.push(tag.clone());
            }
            if let Some(&(s, e)) = words.get(n) {
                run = Some(match run {
                    Some((start, _)) => (start, e),
                    None => (s, e),
                });
            }
        }
        if let Some((s, e)) = run {
            parts.push(text[s..e].to_string());
        }
        parts
    }

    fn push_date(parts: &mut Vec<String>, marker: &str, date: Option<NaiveDate>) {
        if let Some(date) = date {
            parts.push(format!("{marker} {}", date.format("%Y-%m-%d")));
        }
    }

    pub fn render_estimate(minutes: u32) -> String {
        match (minutes / 60, minutes % 60) {
            (0, m) => format!("{m}m"),
            (h, 0) => format!("{h}h"),
            (h, m) => format!("{h}h{m}m"),
        }
    }

    impl Task {
        /// The single line this task occupies.
        pub fn to_line(&self) -> String {
            render_task(self)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::{FileNameDateFallback, ParseContext, parse_line};
        use crate::status::StatusRegistry;

        fn reparse(line: &str, path: &str) -> Task {
            let reg = StatusRegistry::default();
            let fallback = FileNameDateFallback::default();
            let ctx = ParseContext::new(&reg).with_date_fallback(&fallback);
            parse_line(line, &TaskLocation::new(path), &ctx).unwrap()
        }

        #[test]
        fn canonical_order() {
            let t = reparse(
                "- [ ] 📅 2024-01-15 Buy milk ⏫ #shop ^b1",
                "inbox.md",
            );
            assert_eq!(t.to_line(), "- [ ] Buy milk #shop ⏫ 📅 2024-01-15 ^b1");
        }

        #[test]
        fn rendered_line_parses_to_same_fields() {
            let line = "  - [x] Review #work 🔼 🔁 every 2 weeks ⏱ 1h30m 🛫 2024-01-01 ⏳ 2024-01-02 📅 2024-01-03 ✅ 2024-01-04";
            let t = reparse(line, "inbox.md");
            assert_eq!(t.to_line(), line);
            assert!(reparse(&t.to_line(), "inbox.md").same_fields(&t));
        }

        #[test]
        fn inline_tags_keep_their_place() {
            let t = reparse("- [ ] #inbox Buy #shop  milk 📅 2024-01-20 today #later", "inbox.md");
            assert_eq!(t.description, "Buy milk today");
            assert_eq!(t.tags, vec!["#inbox", "#shop", "#later"]);
            assert_eq!(t.tag_offsets, vec![0, 1, 3]);
            assert_eq!(
                t.to_line(),
                "- [ ] #inbox Buy #shop milk today #later 📅 2024-01-20"
            );
            assert!(reparse(&t.to_line(), "inbox.md").same_fields(&t));

            let mut bare = t.clone();
            bare.tag_offsets.clear();
            assert_eq!(
                bare.to_line(),
                "- [ ] Buy milk today #inbox #shop #later 📅 2024-01-20"
            );
        }

        #[test]
        fn inferred_scheduled_date_is_not_written() {
            let t = reparse("- [ ] standup", "2024-03-05.md");
            assert!(t.scheduled_date.is_some());
            assert_eq!(t.to_line(), "- [ ] standup");
        }

        #[test]
        fn estimate_shapes() {
            assert_eq!(render_estimate(45), "45m");
            assert_eq!(render_estimate(120), "2h");
            assert_eq!(render_estimate(90), "1h30m");
        }
    }
}

pub mod toggle {
    //! Status-toggle state machine and the textual fallbacks for non-task lines.

    use crate::core::*;
    use crate::parser::{
        ParseContext, classify_line, leading_indentation, parse_checklist, parse_line,
        parse_list_prefix,
    };
    use crate::recurrence::Occurrence;
    use crate::status::StatusRegistry;
    use chrono::NaiveDate;
    use serde::Serialize;
    use tracing::debug;

    /// Result of toggling a single line.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct ToggleOutcome {
        /// Classification of the line before the toggle.
        pub kind: LineKind,
        /// Replacement text; two lines joined by `\n` when a recurrence split happened.
        pub text: String,
        /// Records produced for task lines, new occurrence first. Empty for fallbacks.
        pub tasks: Vec<Task>,
    }

    /// Move `task` to its next status. Returns one record, or two when completing a
    /// recurring task: the next occurrence followed by the completed original.
    pub fn toggle_task(task: &Task, statuses: &StatusRegistry, today: NaiveDate) -> Vec<Task> {
        let current = statuses.by_symbol(task.status.symbol);
        let next = statuses.next_status(&current);

        let mut toggled = task.clone();
        toggled.status = next.clone();

        let mut produced = Vec::with_capacity(2);
        if next.is_done() && !current.is_done() {
            toggled.done_date = Some(today);
            if let Some(fresh) = next_occurrence(task, statuses, today) {
                debug!(description = %task.description, "recurrence split");
                produced.push(fresh);
            }
        } else if current.is_done() && !next.is_done() {
            toggled.done_date = None;
        }
        toggled.original_markdown = toggled.to_line();
        produced.push(toggled);
        produced
    }

    fn next_occurrence(task: &Task, statuses: &StatusRegistry, today: NaiveDate) -> Option<Task> {
        let recurrence = task.recurrence.as_ref()?;
        let inferred = task.scheduled_date_is_inferred;
        let current = Occurrence {
            start_date: task.start_date,
            scheduled_date: task.scheduled_date.filter(|_| !inferred),
            due_date: task.due_date,
        };
        let dates = recurrence.next_occurrence(current, today)?;

        let done = statuses.next_status(&statuses.by_symbol(task.status.symbol));
        let mut status = statuses.next_status(&done);
        if status.is_done() {
            status = statuses.initial();
        }

        let mut fresh = task.clone();
        fresh.status = status;
        fresh.start_date = dates.start_date;
        if !inferred {
            fresh.scheduled_date = dates.scheduled_date;
        }
        fresh.due_date = dates.due_date;
        fresh.done_date = None;
        fresh.recurrence = Some(recurrence.rebased(&dates));
        // Block ids are unique per document; the anchor stays with the completed line.
        fresh.block_link = None;
        fresh.original_markdown = fresh.to_line();
        Some(fresh)
    }

    /// Toggle any line. Task lines go through the state machine; the others are
    /// rewritten textually (advance the box, add a box, add a list marker).
    pub fn toggle_line(
        line: &str,
        location: &TaskLocation,
        ctx: &ParseContext<'_>,
        today: NaiveDate,
    ) -> ToggleOutcome {
        if let Some(task) = parse_line(line, location, ctx) {
            let tasks = toggle_task(&task, ctx.statuses, today);
            let text = tasks
                .iter()
                .map(|t| t.original_markdown.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            return ToggleOutcome {
                kind: LineKind::Task,
                text,
                tasks,
            };
        }

        let kind = classify_line(line);
        debug!(?kind, line, "textual toggle");
        ToggleOutcome {
            kind,
            text: textual_toggle(line, kind, ctx.statuses),
            tasks: Vec::new(),
        }
    }

    /// Edit for a line that did not parse as a task. A line already classified
    /// as a task is left alone.
    fn textual_toggle(line: &str, kind: LineKind, statuses: &StatusRegistry) -> String {
        match kind {
            LineKind::ChecklistItem => advance_checkbox(line, statuses),
            LineKind::ListItem => insert_checkbox(line),
            LineKind::PlainText => insert_list_marker(line),
            LineKind::Task => line.to_string(),
        }
    }

    fn advance_checkbox(line: &str, statuses: &StatusRegistry) -> String {
        let Some(item) = parse_checklist(line) else {
            return line.to_string();
        };
        let next = statuses.next_status(&statuses.by_symbol(item.symbol));
        let after = item.symbol_offset + item.symbol.len_utf8();
        format!("{}{}{}", &line[..item.symbol_offset], next.symbol, &line[after..])
    }

    fn insert_checkbox(line: &str) -> String {
        let Some(prefix) = parse_list_prefix(line) else {
            return line.to_string();
        };
        let (head, tail) = line.split_at(prefix.len);
        let sep = if head.ends_with(char::is_whitespace) { "" } else { " " };
        format!("{head}{sep}[ ] {tail}")
    }

    fn insert_list_marker(line: &str) -> String {
        let indent = leading_indentation(line);
        format!("{indent}- {}", &line[indent.len()..])
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::status::{Status, StatusType};

        fn day(y: i32, m: u32, d: u32) -> NaiveDate {
            NaiveDate::from_ymd_opt(y, m, d).unwrap()
        }

        fn toggle(line: &str, today: NaiveDate) -> ToggleOutcome {
            let reg = StatusRegistry::default();
            toggle_line(line, &TaskLocation::new("inbox.md"), &ParseContext::new(&reg), today)
        }

        #[test]
        fn completes_simple_task() {
            let out = toggle("- [ ] Buy milk", day(2024, 1, 1));
            assert_eq!(out.kind, LineKind::Task);
            assert_eq!(out.text, "- [x] Buy milk ✅ 2024-01-01");
            assert_eq!(out.tasks.len(), 1);
        }

        #[test]
        fn toggle_twice_restores_task() {
            let reg = StatusRegistry::default();
            let loc = TaskLocation::new("inbox.md");
            let ctx = ParseContext::new(&reg);
            let task = parse_line("- [ ] Buy milk 📅 2024-02-01", &loc, &ctx).unwrap();
            let once = toggle_task(&task, &reg, day(2024, 1, 1));
            let twice = toggle_task(&once[0], &reg, day(2024, 1, 2));
            assert_eq!(twice.len(), 1);
            assert_eq!(twice[0].status, task.status);
            assert_eq!(twice[0].done_date, None);
            assert_eq!(twice[0].to_line(), "- [ ] Buy milk 📅 2024-02-01");
        }

        #[test]
        fn plain_text_gains_marker() {
            let out = toggle("  Just text", day(2024, 1, 1));
            assert_eq!(out.kind, LineKind::PlainText);
            assert_eq!(out.text, "  - Just text");
            assert!(out.tasks.is_empty());
        }

        #[test]
        fn textual_toggle_leaves_task_lines_alone() {
            let reg = StatusRegistry::default();
            let line = "- [ ] already a task";
            assert_eq!(textual_toggle(line, LineKind::Task, &reg), line);
            assert_eq!(textual_toggle("text", LineKind::PlainText, &reg), "- text");
        }

        #[test]
        fn list_item_gains_box_and_box_advances() {
            assert_eq!(toggle("- note", day(2024, 1, 1)).text, "- [ ] note");
            assert_eq!(toggle("-", day(2024, 1, 1)).text, "- [ ] ");
            assert_eq!(toggle("  * [ ] ", day(2024, 1, 1)).text, "  * [x] ");
        }

        #[test]
        fn recurring_task_splits() {
            let out = toggle("- [ ] Pay rent 🔁 every month 📅 2024-01-01", day(2024, 1, 15));
            assert_eq!(out.tasks.len(), 2);
            assert_eq!(
                out.text,
                "- [ ] Pay rent 🔁 every month 📅 2024-02-01\n\
                 - [x] Pay rent 🔁 every month 📅 2024-01-01 ✅ 2024-01-15"
            );
            let fresh = &out.tasks[0];
            assert_eq!(fresh.recurrence.as_ref().unwrap().reference_date, Some(day(2024, 2, 1)));
            assert_eq!(fresh.done_date, None);
        }

        #[test]
        fn unreachable_next_occurrence_completes_without_split() {
            for line in [
                "- [ ] x 🔁 every 400000000 years 📅 2024-01-01",
                "- [ ] x 🔁 every 100000000 months 📅 2024-01-01",
                "- [ ] x 🔁 every 1000000000 weeks on monday 📅 2024-01-01",
            ] {
                let out = toggle(line, day(2024, 1, 15));
                assert_eq!(out.tasks.len(), 1, "{line}");
                assert!(out.text.ends_with("✅ 2024-01-15"));
            }
        }

        #[test]
        fn recurring_task_without_dates_does_not_split() {
            let out = toggle("- [ ] Stretch 🔁 every day", day(2024, 1, 15));
            assert_eq!(out.tasks.len(), 1);
            assert_eq!(out.text, "- [x] Stretch 🔁 every day ✅ 2024-01-15");
        }

        #[test]
        fn in_progress_transition_touches_no_dates() {
            let reg = StatusRegistry::default()
                .layered([Status::new(' ', "Todo", '/', StatusType::Todo)]);
            let ctx = ParseContext::new(&reg);
            let out = toggle_line(
                "- [ ] Draft 📅 2024-03-01",
                &TaskLocation::new("a.md"),
                &ctx,
                day(2024, 1, 1),
            );
            assert_eq!(out.text, "- [/] Draft 📅 2024-03-01");
        }

        #[test]
        fn block_link_stays_on_completed_line() {
            let out = toggle("- [ ] Water plants 🔁 every week 📅 2024-01-01 ^w1", day(2024, 1, 1));
            assert_eq!(out.tasks[0].block_link, None);
            assert_eq!(out.tasks[1].block_link.as_deref(), Some("^w1"));
        }
    }
}

pub mod cursor {
    use crate::parser::{contains_done_date, leading_indentation};

    /// Width of ` ✅ YYYY-MM-DD` in characters.
    pub const DONE_ANNOTATION_WIDTH: usize = 13;

    /// Where a cursor at `offset` (in characters) on `old_line` lands on `new_line`.
    ///
    /// Toggling only ever inserts a list marker, an empty box, a done annotation or a
    /// duplicated recurring line, so the shift is derived from those shapes. The result
    /// never exceeds the character length of `new_line`.
    pub fn reconcile(offset: usize, old_line: &str, new_line: &str) -> usize {
        let old_len = old_line.chars().count();
        let new_len = new_line.chars().count();
        if new_len <= old_len {
            return offset.min(new_len);
        }

        let mut delta = new_len - old_len;
        if delta >= DONE_ANNOTATION_WIDTH && contains_done_date(new_line) {
            delta -= DONE_ANNOTATION_WIDTH;
        }

        let shifted = if delta >= old_len && new_line.contains('\n') {
            offset + delta
        } else if offset < leading_indentation(new_line).chars().count() {
            offset
        } else {
            offset + delta
        };
        shifted.min(new_len)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn shrinking_line_clamps() {
            assert_eq!(reconcile(20, "- [x] done ✅ 2024-01-01", "- [ ] done"), 10);
            assert_eq!(reconcile(3, "- [x] done ✅ 2024-01-01", "- [ ] done"), 3);
            assert_eq!(reconcile(4, "abcd", "abcd"), 4);
        }

        #[test]
        fn done_annotation_does_not_move_cursor() {
            let old = "- [ ] Buy milk";
            let new = "- [ ] Buy milk ✅ 2024-01-01";
            assert_eq!(reconcile(6, old, new), 6);
        }

        #[test]
        fn list_marker_insertion() {
            assert_eq!(reconcile(1, "  Just text", "  - Just text"), 1);
            assert_eq!(reconcile(2, "  Just text", "  - Just text"), 4);
            assert_eq!(reconcile(5, "  Just text", "  - Just text"), 7);
        }

        #[test]
        fn duplicated_line_moves_to_second_copy() {
            let old = "- [ ] Pay 🔁 every day 📅 2024-01-01";
            let new = "- [ ] Pay 🔁 every day 📅 2024-01-02\n- [x] Pay 🔁 every day 📅 2024-01-01 ✅ 2024-01-01";
            let len = old.chars().count();
            assert_eq!(reconcile(4, old, new), 4 + len + 1);
        }

        #[test]
        fn never_past_end() {
            assert_eq!(reconcile(100, "x", "- x"), 3);
        }
    }
}

pub mod editor {
    //! Editing-surface seam. The core talks to the host only through [`EditorSurface`].

    use crate::core::TaskLocation;
    use crate::cursor::reconcile;
    use crate::parser::ParseContext;
    use crate::toggle::{ToggleOutcome, toggle_line};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};

    /// Zero-based line and character column.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct CursorPosition {
        pub line: usize,
        pub ch: usize,
    }

    pub trait EditorSurface {
        fn line(&self, n: usize) -> Option<String>;
        /// Replace line `n`; `text` may contain line breaks.
        fn set_line(&mut self, n: usize, text: &str);
        fn cursor(&self) -> CursorPosition;
        fn set_cursor(&mut self, pos: CursorPosition);
    }

    /// In-memory document used by the CLI and tests.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct LineBuffer {
        lines: Vec<String>,
        cursor: CursorPosition,
        trailing_newline: bool,
    }

    impl LineBuffer {
        pub fn from_text(text: &str) -> Self {
            Self {
                lines: text.lines().map(str::to_string).collect(),
                cursor: CursorPosition::default(),
                trailing_newline: text.ends_with('\n'),
            }
        }

        pub fn text(&self) -> String {
            let mut out = self.lines.join("\n");
            if self.trailing_newline {
                out.push('\n');
            }
            out
        }

        pub fn len(&self) -> usize {
            self.lines.len()
        }

        pub fn is_empty(&self) -> bool {
            self.lines.is_empty()
        }
    }

    impl EditorSurface for LineBuffer {
        fn line(&self, n: usize) -> Option<String> {
            self.lines.get(n).cloned()
        }

        fn set_line(&mut self, n: usize, text: &str) {
            let replacement = text.split('\n').map(str::to_string);
            if n < self.lines.len() {
                self.lines.splice(n..=n, replacement);
            } else {
                self.lines.extend(replacement);
            }
        }

        fn cursor(&self) -> CursorPosition {
            self.cursor
        }

        fn set_cursor(&mut self, pos: CursorPosition) {
            self.cursor = pos;
        }
    }

    /// Toggle the line under the cursor and put the cursor where it belongs afterwards.
    /// `None` when the cursor is outside the document.
    pub fn toggle_at_cursor(
        editor: &mut dyn EditorSurface,
        path: &str,
        ctx: &ParseContext<'_>,
        today: NaiveDate,
    ) -> Option<ToggleOutcome> {
        let cursor = editor.cursor();
        let line = editor.line(cursor.line)?;
        let location = TaskLocation {
            line_number: cursor.line,
            ..TaskLocation::new(path)
        };
        let outcome = toggle_line(&line, &location, ctx, today);
        let offset = reconcile(cursor.ch, &line, &outcome.text);
        editor.set_line(cursor.line, &outcome.text);

        let mut pos = CursorPosition {
            line: cursor.line,
            ch: 0,
        };
        for c in outcome.text.chars().take(offset) {
            if c == '\n' {
                pos.line += 1;
                pos.ch = 0;
            } else {
                pos.ch += 1;
            }
        }
        editor.set_cursor(pos);
        Some(outcome)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::status::StatusRegistry;

        fn today() -> NaiveDate {
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        }

        #[test]
        fn set_line_splices_multiple_lines() {
            let mut buf = LineBuffer::from_text("a\nb\nc\n");
            buf.set_line(1, "b1\nb2");
            assert_eq!(buf.text(), "a\nb1\nb2\nc\n");
            assert_eq!(buf.len(), 4);
        }

        #[test]
        fn toggles_plain_text_under_cursor() {
            let reg = StatusRegistry::default();
            let mut buf = LineBuffer::from_text("# Notes\n  Just text\n");
            buf.set_cursor(CursorPosition { line: 1, ch: 5 });
            let out = toggle_at_cursor(&mut buf, "notes.md", &ParseContext::new(&reg), today());
            assert!(out.is_some());
            assert_eq!(buf.text(), "# Notes\n  - Just text\n");
            assert_eq!(buf.cursor(), CursorPosition { line: 1, ch: 7 });
        }

        #[test]
        fn recurrence_split_keeps_column_on_completed_line() {
            let reg = StatusRegistry::default();
            let mut buf = LineBuffer::from_text("- [ ] Pay rent 🔁 every month 📅 2024-01-01");
            buf.set_cursor(CursorPosition { line: 0, ch: 8 });
            toggle_at_cursor(&mut buf, "bills.md", &ParseContext::new(&reg), today());
            assert_eq!(buf.len(), 2);
            assert_eq!(buf.cursor(), CursorPosition { line: 1, ch: 8 });
            assert!(buf.line(1).unwrap().starts_with("- [x] Pay rent"));
        }

        #[test]
        fn cursor_outside_document() {
            let reg = StatusRegistry::default();
            let mut buf = LineBuffer::from_text("- [ ] a");
            buf.set_cursor(CursorPosition { line: 3, ch: 0 });
            assert!(toggle_at_cursor(&mut buf, "a.md", &ParseContext::new(&reg), today()).is_none());
        }
    }
}

pub mod query {
    //! Declarative query language: one instruction per line, filters compose
    //! conjunctively, sorts are stable, groups keep first-appearance order.

    use crate::core::*;
    use crate::parser::parse_iso_date;
    use crate::status::StatusType;
    use chrono::{Duration, NaiveDate};
    use indexmap::IndexMap;
    use regex::{Regex, RegexBuilder};
    use serde::Serialize;
    use std::cmp::Ordering;
    use std::str::FromStr;
    use tracing::debug;

    /* ------------------------------- Errors ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    #[error("query line {line_number}: {reason}: `{instruction}`")]
    pub struct QueryError {
        /// One-based line number in the query source.
        pub line_number: usize,
        pub instruction: String,
        pub reason: String,
    }

    /* ---------------------------- Instructions ---------------------------- */

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateRef {
        Today,
        Tomorrow,
        Yesterday,
        On(NaiveDate),
    }

    impl DateRef {
        fn parse(s: &str) -> Option<Self> {
            match s.trim() {
                "today" => Some(Self::Today),
                "tomorrow" => Some(Self::Tomorrow),
                "yesterday" => Some(Self::Yesterday),
                other => parse_iso_date(other).map(Self::On),
            }
        }

        pub fn resolve(self, today: NaiveDate) -> NaiveDate {
            match self {
                Self::Today => today,
                Self::Tomorrow => today + Duration::days(1),
                Self::Yesterday => today - Duration::days(1),
                Self::On(d) => d,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateComparison {
        Before,
        After,
        On,
        OnOrBefore,
        OnOrAfter,
    }

    impl DateComparison {
        fn holds(self, date: NaiveDate, target: NaiveDate) -> bool {
            match self {
                Self::Before => date < target,
                Self::After => date > target,
                Self::On => date == target,
                Self::OnOrBefore => date <= target,
                Self::OnOrAfter => date >= target,
            }
        }
    }

    /// A single date field, or `happens` (any of start/scheduled/due).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DateSubject {
        Field(DateField),
        Happens,
    }

    impl DateSubject {
        fn parse(s: &str) -> Option<Self> {
            match s {
                "happens" => Some(Self::Happens),
                other => DateField::from_name(other).map(Self::Field),
            }
        }

        fn dates(self, task: &Task) -> Vec<NaiveDate> {
            match self {
                Self::Field(field) => field.get(task).into_iter().collect(),
                Self::Happens => [task.start_date, task.scheduled_date, task.due_date]
                    .into_iter()
                    .flatten()
                    .collect(),
            }
        }

        /// The date used for sorting and grouping.
        fn sort_date(self, task: &Task) -> Option<NaiveDate> {
            match self {
                Self::Field(field) => field.get(task),
                Self::Happens => task.happens(),
            }
        }

        fn name(self) -> &'static str {
            match self {
                Self::Field(field) => field.name(),
                Self::Happens => "happens",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum TextField {
        Description,
        Path,
        Heading,
    }

    impl TextField {
        fn value(self, task: &Task) -> &str {
            match self {
                Self::Description => &task.description,
                Self::Path => &task.location.path,
                Self::Heading => task.location.preceding_header.as_deref().unwrap_or(""),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub enum TextMatch {
        /// Lowercased needle; matched case-insensitively.
        Includes(String),
        Regex(Regex),
    }

    impl TextMatch {
        fn matches(&self, haystack: &str) -> bool {
            match self {
                Self::Includes(needle) => haystack.to_lowercase().contains(needle),
                Self::Regex(re) => re.is_match(haystack),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PriorityComparison {
        Is,
        Above,
        Below,
    }

    #[derive(Debug, Clone)]
    pub enum Filter {
        Done(bool),
        Recurring(bool),
        StatusType { kind: StatusType, negate: bool },
        StatusName { needle: String, negate: bool },
        Date { subject: DateSubject, comparison: DateComparison, date: DateRef },
        HasDate { subject: DateSubject, present: bool },
        /// `rank` as returned by [`priority_rank`].
        Priority { comparison: PriorityComparison, rank: u8 },
        Tag { needle: String, negate: bool },
        Text { field: TextField, matcher: TextMatch, negate: bool },
    }

    impl Filter {
        pub fn matches(&self, task: &Task, today: NaiveDate) -> bool {
            match self {
                Self::Done(done) => task.status.is_completed() == *done,
                Self::Recurring(recurring) => task.is_recurring() == *recurring,
                Self::StatusType { kind, negate } => (task.status.kind == *kind) != *negate,
                Self::StatusName { needle, negate } => {
                    task.status.name.to_lowercase().contains(needle) != *negate
                }
                Self::Date {
                    subject,
                    comparison,
                    date,
                } => {
                    let target = date.resolve(today);
                    subject
                        .dates(task)
                        .into_iter()
                        .any(|d| comparison.holds(d, target))
                }
                Self::HasDate { subject, present } => {
                    !subject.dates(task).is_empty() == *present
                }
                Self::Priority { comparison, rank } => {
                    let own = priority_rank(task.priority);
                    match comparison {
                        PriorityComparison::Is => own == *rank,
                        PriorityComparison::Above => own < *rank,
                        PriorityComparison::Below => own > *rank,
                    }
                }
                Self::Tag { needle, negate } => {
                    task.tags.iter().any(|t| t.to_lowercase().contains(needle)) != *negate
                }
                Self::Text {
                    field,
                    matcher,
                    negate,
                } => matcher.matches(field.value(task)) != *negate,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SortKey {
        Status,
        Priority,
        Date(DateSubject),
        Description,
        Path,
        Tag,
        Recurring,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Sorter {
        pub key: SortKey,
        pub reverse: bool,
    }

    impl Sorter {
        pub fn compare(&self, a: &Task, b: &Task) -> Ordering {
            let ord = match self.key {
                SortKey::Status => a.status.kind.sort_rank().cmp(&b.status.kind.sort_rank()),
                SortKey::Priority => priority_rank(a.priority).cmp(&priority_rank(b.priority)),
                SortKey::Date(subject) => missing_last(subject.sort_date(a), subject.sort_date(b)),
                SortKey::Description => a
                    .description
                    .to_lowercase()
                    .cmp(&b.description.to_lowercase()),
                SortKey::Path => (&a.location.path, a.location.line_number)
                    .cmp(&(&b.location.path, b.location.line_number)),
                SortKey::Tag => missing_last(
                    a.tags.first().map(|t| t.to_lowercase()),
                    b.tags.first().map(|t| t.to_lowercase()),
                ),
                SortKey::Recurring => b.is_recurring().cmp(&a.is_recurring()),
            };
            if self.reverse { ord.reverse() } else { ord }
        }
    }

    fn missing_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GroupKey {
        Status,
        StatusType,
        Priority,
        Date(DateSubject),
        Path,
        Filename,
        Folder,
        Heading,
        Tags,
        Recurring,
        Recurrence,
    }

    impl GroupKey {
        pub fn key(&self, task: &Task) -> String {
            match self {
                Self::Status => task.status.name.clone(),
                Self::StatusType => task.status.kind.as_str().to_string(),
                Self::Priority => match task.priority {
                    Some(p) => format!("Priority {}: {}", p.ordinal(), p.name()),
                    None => "No priority".to_string(),
                },
                Self::Date(subject) => match subject.sort_date(task) {
                    Some(d) => d.format("%Y-%m-%d %A").to_string(),
                    None => format!("No {} date", subject.name()),
                },
                Self::Path => task.location.path.clone(),
                Self::Filename => task.location.file_name().to_string(),
                Self::Folder => task.location.folder(),
                Self::Heading => task
                    .location
                    .preceding_header
                    .clone()
                    .unwrap_or_else(|| "(No heading)".to_string()),
                Self::Tags if task.tags.is_empty() => "(No tags)".to_string(),
                Self::Tags => task.tags.join(", "),
                Self::Recurring if task.is_recurring() => "Recurring".to_string(),
                Self::Recurring => "Not Recurring".to_string(),
                Self::Recurrence => task
                    .recurrence
                    .as_ref()
                    .map(|r| r.text.clone())
                    .unwrap_or_else(|| "None".to_string()),
            }
        }
    }

    /* ------------------------------- Output ------------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct TaskGroup {
        /// One key per grouper; empty when the query has no `group by`.
        pub keys: Vec<String>,
        pub tasks: Vec<Task>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
    pub struct TaskGroups {
        pub groups: Vec<TaskGroup>,
    }

    impl TaskGroups {
        pub fn len(&self) -> usize {
            self.groups.len()
        }

        pub fn is_empty(&self) -> bool {
            self.groups.is_empty()
        }

        pub fn total_tasks(&self) -> usize {
            self.groups.iter().map(|g| g.tasks.len()).sum()
        }

        pub fn iter(&self) -> impl Iterator<Item = &TaskGroup> {
            self.groups.iter()
        }
    }

    /* -------------------------------- Query -------------------------------- */

    /// A compiled query. Holds no state beyond the instructions.
    #[derive(Debug, Clone, Default)]
    pub struct Query {
        pub filters: Vec<Filter>,
        pub sorters: Vec<Sorter>,
        pub groupers: Vec<GroupKey>,
        pub limit: Option<usize>,
        pub source: String,
    }

    enum Instruction {
        Filter(Filter),
        Sort(Sorter),
        Group(GroupKey),
        Limit(usize),
    }

    impl FromStr for Query {
        type Err = QueryError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::parse(s)
        }
    }

    impl Query {
        /// Compile every instruction; the first bad line fails the whole query.
        pub fn parse(source: &str) -> Result<Self, QueryError> {
            let mut query = Query {
                source: source.to_string(),
                ..Query::default()
            };
            for (idx, raw) in source.lines().enumerate() {
                let line = raw.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let instruction = parse_instruction(line).map_err(|reason| QueryError {
                    line_number: idx + 1,
                    instruction: line.to_string(),
                    reason,
                })?;
                match instruction {
                    Instruction::Filter(f) => query.filters.push(f),
                    Instruction::Sort(s) => query.sorters.push(s),
                    Instruction::Group(g) => query.groupers.push(g),
                    Instruction::Limit(n) => query.limit = Some(n),
                }
            }
            debug!(
                filters = query.filters.len(),
                sorters = query.sorters.len(),
                groupers = query.groupers.len(),
                limit = ?query.limit,
                "compiled query"
            );
            Ok(query)
        }

        /// Filter, sort, limit, then partition. Pure; `today` anchors relative dates.
        pub fn apply(&self, tasks: &[Task], today: NaiveDate) -> TaskGroups {
            let mut selected: Vec<&Task> = tasks
                .iter()
                .filter(|t| self.filters.iter().all(|f| f.matches(t, today)))
                .collect();
            selected.sort_by(|a, b| {
                self.sorters
                    .iter()
                    .fold(Ordering::Equal, |ord, s| ord.then_with(|| s.compare(a, b)))
            });
            if let Some(limit) = self.limit {
                selected.truncate(limit);
            }

            let mut buckets: IndexMap<Vec<String>, Vec<Task>> = IndexMap::new();
            if self.groupers.is_empty() {
                buckets.insert(Vec::new(), Vec::new());
            }
            for task in selected {
                let keys: Vec<String> = self.groupers.iter().map(|g| g.key(task)).collect();
                buckets.entry(keys).or_default().push(task.clone());
            }
            TaskGroups {
                groups: buckets
                    .into_iter()
                    .map(|(keys, tasks)| TaskGroup { keys, tasks })
                    .collect(),
            }
        }
    }

    /* ------------------------------ Compiling ------------------------------ */

    // Matching runs on an ASCII-lowercased copy; it has the same byte layout as the
    // original, so user text (regexes, needles) is sliced from the original line.
    fn parse_instruction(line: &str) -> Result<Instruction, String> {
        let lower = line.to_ascii_lowercase();

        match lower.as_str() {
            "done" => return Ok(Instruction::Filter(Filter::Done(true))),
            "not done" => return Ok(Instruction::Filter(Filter::Done(false))),
            "is recurring" => return Ok(Instruction::Filter(Filter::Recurring(true))),
            "is not recurring" => return Ok(Instruction::Filter(Filter::Recurring(false))),
            _ => {}
        }

        if let Some(rest) = lower.strip_prefix("sort by ") {
            return parse_sort(rest).map(Instruction::Sort);
        }
        if let Some(rest) = lower.strip_prefix("group by ") {
            return parse_group(rest.trim()).map(Instruction::Group);
        }
        if let Some(rest) = lower.strip_prefix("limit ") {
            return parse_limit(rest).map(Instruction::Limit);
        }
        if let Some(rest) = lower.strip_prefix("status.type is ") {
            let (negate, rest) = strip_not(rest);
            let kind = StatusType::parse(rest)
                .ok_or_else(|| format!("unknown status type '{}'", rest.trim()))?;
            return Ok(Instruction::Filter(Filter::StatusType { kind, negate }));
        }
        if let Some(rest) = lower.strip_prefix("status.name ") {
            let (negate, needle) = includes_clause(rest)?;
            return Ok(Instruction::Filter(Filter::StatusName {
                needle: needle.trim().to_lowercase(),
                negate,
            }));
        }
        if let Some(filter) = parse_has_date(&lower)? {
            return Ok(Instruction::Filter(filter));
        }
        if let Some(rest) = lower.strip_prefix("priority is ") {
            return parse_priority(rest).map(Instruction::Filter);
        }
        if let Some(rest) = lower
            .strip_prefix("tags ")
            .or_else(|| lower.strip_prefix("tag "))
        {
            let (negate, needle) = includes_clause(rest)?;
            return Ok(Instruction::Filter(Filter::Tag {
                needle: needle.trim().to_lowercase(),
                negate,
            }));
        }
        for (word, field) in [
            ("description ", TextField::Description),
            ("path ", TextField::Path),
            ("heading ", TextField::Heading),
        ] {
            if let Some(rest) = lower.strip_prefix(word) {
                let (matcher, negate) = parse_text_match(rest, original_tail(line, rest))?;
                return Ok(Instruction::Filter(Filter::Text {
                    field,
                    matcher,
                    negate,
                }));
            }
        }
        if let Some((subject, rest)) = lower
            .split_once(' ')
            .and_then(|(word, rest)| DateSubject::parse(word).map(|s| (s, rest)))
        {
            return parse_date_filter(subject, rest).map(Instruction::Filter);
        }
        Err("unrecognized instruction".to_string())
    }

    fn original_tail<'a>(line: &'a str, lower_rest: &str) -> &'a str {
        &line[line.len() - lower_rest.len()..]
    }

    fn strip_not(rest: &str) -> (bool, &str) {
        match rest.strip_prefix("not ") {
            Some(r) => (true, r),
            None => (false, rest),
        }
    }

    /// `include(s) X` or `do(es) not include X` → (negate, X).
    fn includes_clause(rest: &str) -> Result<(bool, &str), String> {
        for (prefix, negate) in [
            ("includes ", false),
            ("include ", false),
            ("does not include ", true),
            ("do not include ", true),
        ] {
            if let Some(value) = rest.strip_prefix(prefix) {
                if value.trim().is_empty() {
                    return Err("missing value".to_string());
                }
                return Ok((negate, value));
            }
        }
        Err("expected 'includes' or 'does not include'".to_string())
    }

    fn parse_text_match(lower: &str, original: &str) -> Result<(TextMatch, bool), String> {
        for (prefix, negate) in [("regex matches ", false), ("regex does not match ", true)] {
            if lower.starts_with(prefix) {
                let pattern = original[prefix.len()..].trim();
                return compile_regex(pattern).map(|re| (TextMatch::Regex(re), negate));
            }
        }
        let (negate, needle) = includes_clause(lower)?;
        Ok((TextMatch::Includes(needle.trim().to_lowercase()), negate))
    }

    fn compile_regex(pattern: &str) -> Result<Regex, String> {
        let body = pattern
            .strip_prefix('/')
            .ok_or_else(|| "regex must be written as /pattern/".to_string())?;
        let (expr, flags) = body
            .rsplit_once('/')
            .ok_or_else(|| "regex must be written as /pattern/".to_string())?;
        if let Some(flag) = flags.chars().find(|c| *c != 'i') {
            return Err(format!("unsupported regex flag '{flag}'"));
        }
        RegexBuilder::new(expr)
            .case_insensitive(flags.contains('i'))
            .build()
            .map_err(|e| format!("invalid regex: {e}"))
    }

    fn parse_has_date(lower: &str) -> Result<Option<Filter>, String> {
        let (present, rest) = if let Some(rest) = lower.strip_prefix("has ") {
            (true, rest)
        } else if let Some(rest) = lower.strip_prefix("no ") {
            (false, rest)
        } else {
            return Ok(None);
        };
        let Some(word) = rest.strip_suffix(" date") else {
            return Ok(None);
        };
        let subject = DateSubject::parse(word.trim())
            .ok_or_else(|| format!("unknown date field '{}'", word.trim()))?;
        Ok(Some(Filter::HasDate { subject, present }))
    }

    fn parse_priority(rest: &str) -> Result<Filter, String> {
        let (comparison, name) = if let Some(n) = rest.strip_prefix("above ") {
            (PriorityComparison::Above, n)
        } else if let Some(n) = rest.strip_prefix("below ") {
            (PriorityComparison::Below, n)
        } else {
            (PriorityComparison::Is, rest)
        };
        let rank = match name.trim() {
            "none" => priority_rank(None),
            other => priority_rank(Some(
                Priority::from_name(other).ok_or_else(|| format!("unknown priority '{other}'"))?,
            )),
        };
        Ok(Filter::Priority { comparison, rank })
    }

    fn parse_date_filter(subject: DateSubject, rest: &str) -> Result<Filter, String> {
        let (comparison, value) = [
            ("on or before ", DateComparison::OnOrBefore),
            ("on or after ", DateComparison::OnOrAfter),
            ("before ", DateComparison::Before),
            ("after ", DateComparison::After),
            ("on ", DateComparison::On),
        ]
        .into_iter()
        .find_map(|(prefix, cmp)| rest.strip_prefix(prefix).map(|v| (cmp, v)))
        .unwrap_or((DateComparison::On, rest));
        let date = DateRef::parse(value).ok_or_else(|| format!("invalid date '{}'", value.trim()))?;
        Ok(Filter::Date {
            subject,
            comparison,
            date,
        })
    }

    fn parse_sort(rest: &str) -> Result<Sorter, String> {
        let mut words = rest.split_whitespace();
        let field = words.next().ok_or_else(|| "missing sort field".to_string())?;
        let reverse = match words.next() {
            None => false,
            Some("reverse") => true,
            Some(other) => return Err(format!("unexpected '{other}' after sort field")),
        };
        if words.next().is_some() {
            return Err("trailing text after 'reverse'".to_string());
        }
        let key = match field {
            "status" => SortKey::Status,
            "priority" => SortKey::Priority,
            "description" => SortKey::Description,
            "path" => SortKey::Path,
            "tag" | "tags" => SortKey::Tag,
            "recurring" => SortKey::Recurring,
            other => SortKey::Date(
                DateSubject::parse(other).ok_or_else(|| format!("unknown sort field '{other}'"))?,
            ),
        };
        Ok(Sorter { key, reverse })
    }

    fn parse_group(field: &str) -> Result<GroupKey, String> {
        Ok(match field {
            "status" => GroupKey::Status,
            "status.type" => GroupKey::StatusType,
            "priority" => GroupKey::Priority,
            "path" => GroupKey::Path,
            "filename" => GroupKey::Filename,
            "folder" => GroupKey::Folder,
            "heading" => GroupKey::Heading,
            "tags" | "tag" => GroupKey::Tags,
            "recurring" => GroupKey::Recurring,
            "recurrence" => GroupKey::Recurrence,
            other => GroupKey::Date(
                DateSubject::parse(other).ok_or_else(|| format!("unknown group field '{other}'"))?,
            ),
        })
    }

    fn parse_limit(rest: &str) -> Result<usize, String> {
        let rest = rest.strip_prefix("to ").unwrap_or(rest).trim();
        let rest = rest
            .strip_suffix("tasks")
            .or_else(|| rest.strip_suffix("task"))
            .unwrap_or(rest)
            .trim();
        rest.parse()
            .map_err(|_| format!("invalid limit '{rest}'"))
    }

}

pub mod config {
    //! `tasks.toml`: extra statuses and the path date fallback.

    use crate::parser::{DateFallback, FileNameDateFallback, NoDateFallback};
    use crate::status::{Status, StatusRegistry, StatusType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("invalid config: {0}")]
        Toml(#[from] toml::de::Error),
        #[error("status {field} must be exactly one character, got {value:?}")]
        InvalidSymbol { field: &'static str, value: String },
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TasksConfig {
        #[serde(default)]
        pub statuses: Vec<StatusConfig>,
        #[serde(default)]
        pub date_fallback: DateFallbackConfig,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StatusConfig {
        pub symbol: String,
        pub name: String,
        pub next: String,
        #[serde(rename = "type", default)]
        pub kind: StatusType,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DateFallbackConfig {
        #[serde(default)]
        pub enabled: bool,
        /// Restrict inference to these folders; empty means everywhere.
        #[serde(default)]
        pub folders: Vec<String>,
    }

    impl TasksConfig {
        pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
            let config: TasksConfig = toml::from_str(s)?;
            // Symbols are checked at load.
            config.configured_statuses()?;
            Ok(config)
        }

        fn configured_statuses(&self) -> Result<Vec<Status>, ConfigError> {
            self.statuses
                .iter()
                .map(|s| {
                    Ok(Status::new(
                        single_char("symbol", &s.symbol)?,
                        s.name.clone(),
                        single_char("next", &s.next)?,
                        s.kind,
                    ))
                })
                .collect()
        }

        /// Configured statuses layered over the defaults.
        pub fn status_registry(&self) -> Result<StatusRegistry, ConfigError> {
            Ok(StatusRegistry::default().layered(self.configured_statuses()?))
        }

        pub fn date_fallback(&self) -> Box<dyn DateFallback> {
            if self.date_fallback.enabled {
                Box::new(FileNameDateFallback {
                    folders: self.date_fallback.folders.clone(),
                })
            } else {
                Box::new(NoDateFallback)
            }
        }
    }

    fn single_char(field: &'static str, value: &str) -> Result<char, ConfigError> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(ConfigError::InvalidSymbol {
                field,
                value: value.to_string(),
            }),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn layers_statuses_and_enables_fallback() {
            let cfg = TasksConfig::from_toml_str(
                r#"
[[statuses]]
symbol = " "
name = "Todo"
next = "/"

[[statuses]]
symbol = "/"
name = "Doing"
next = "x"
type = "in_progress"

[date_fallback]
enabled = true
folders = ["daily"]
"#,
            )
            .unwrap();
            let reg = cfg.status_registry().unwrap();
            assert_eq!(reg.by_symbol(' ').next_symbol, '/');
            assert_eq!(reg.by_symbol('/').name, "Doing");
            assert_eq!(reg.by_symbol('/').kind, StatusType::InProgress);
            assert_eq!(reg.by_symbol('-').kind, StatusType::Cancelled);
            let fallback = cfg.date_fallback();
            assert!(fallback.date_from_path("daily/2024-02-02.md").is_some());
            assert!(fallback.date_from_path("other/2024-02-02.md").is_none());
        }

        #[test]
        fn empty_config_is_defaults() {
            let cfg = TasksConfig::from_toml_str("").unwrap();
            assert_eq!(cfg.status_registry().unwrap(), StatusRegistry::default());
            assert!(cfg.date_fallback().date_from_path("2024-02-02.md").is_none());
        }

        #[test]
        fn rejects_multi_char_symbol() {
            let err = TasksConfig::from_toml_str(
                "[[statuses]]\nsymbol = \"xx\"\nname = \"Bad\"\nnext = \" \"\n",
            )
            .unwrap_err();
            assert!(matches!(err, ConfigError::InvalidSymbol { field: "symbol", .. }));
            assert!(TasksConfig::from_toml_str("statuses = 3").is_err());
        }
    }
}

pub use config::{ConfigError, TasksConfig};
pub use self::core::{Priority, Task, TaskLocation};
pub use cursor::reconcile;
pub use editor::{CursorPosition, EditorSurface, LineBuffer, toggle_at_cursor};
pub use parser::{
    DateFallback, FileNameDateFallback, NoDateFallback, ParseContext, classify_line, parse_document,
    parse_line,
};
pub use query::{Query, QueryError, TaskGroup, TaskGroups};
pub use recurrence::{Recurrence, RecurrenceParseError};
pub use status::{Status, StatusRegistry, StatusType};
pub use toggle::{ToggleOutcome, toggle_line, toggle_task};
