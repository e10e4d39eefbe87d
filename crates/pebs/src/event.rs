//! Counter programming: event selection, privilege filter and sample period.

use std::fmt;
use std::str::FromStr;

use msr::registers::{EVTSEL_EN, EVTSEL_OS, EVTSEL_USR, NUM_COUNTERS};

/// A micro-architectural event: event code plus unit mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event {
    pub code: u8,
    pub umask: u8,
}

impl Event {
    /// MEM_LOAD_RETIRED.L2_MISS
    pub const MEM_LOAD_L2_MISS: Event = Event::from_raw(0x10d1);
    /// MEM_TRANS_RETIRED.PRECISE_STORE
    pub const PRECISE_STORE: Event = Event::from_raw(0x02cd);
    /// LONGEST_LAT_CACHE.REFERENCE
    pub const LLC_REFERENCES: Event = Event::from_raw(0x4f2e);
    /// LONGEST_LAT_CACHE.MISS
    pub const LLC_MISSES: Event = Event::from_raw(0x412e);
    /// BR_INST_RETIRED.ALL_BRANCHES
    pub const BRANCH_INSTRUCTIONS: Event = Event::from_raw(0x00c4);
    /// BR_MISP_RETIRED.ALL_BRANCHES
    pub const BRANCH_MISSES: Event = Event::from_raw(0x00c5);

    pub const fn new(code: u8, umask: u8) -> Self {
        Event { code, umask }
    }

    /// Splits the conventional `0xUUEE` encoding (umask high, code low)
    pub const fn from_raw(raw: u16) -> Self {
        Event {
            code: raw as u8,
            umask: (raw >> 8) as u8,
        }
    }

    pub const fn raw(&self) -> u16 {
        (self.umask as u16) << 8 | self.code as u16
    }

    /// Looks an event up by its symbolic name
    pub fn by_name(name: &str) -> Option<Event> {
        let event = match name {
            "mem-load-l2-miss" => Event::MEM_LOAD_L2_MISS,
            "precise-store" => Event::PRECISE_STORE,
            "llc-references" => Event::LLC_REFERENCES,
            "llc-misses" => Event::LLC_MISSES,
            "branch-instructions" => Event::BRANCH_INSTRUCTIONS,
            "branch-misses" => Event::BRANCH_MISSES,
            _ => return None,
        };
        Some(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.raw())
    }
}

impl FromStr for Event {
    type Err = String;

    /// Accepts a symbolic name or a hex `0xUUEE` value
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(event) = Event::by_name(s) {
            return Ok(event);
        }
        let digits = s.strip_prefix("0x").unwrap_or(s);
        u16::from_str_radix(digits, 16)
            .map(Event::from_raw)
            .map_err(|_| format!("unknown event '{}'", s))
    }
}

/// Privilege levels a counter counts at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Kernel,
    All,
}

impl Privilege {
    fn bits(self) -> u64 {
        match self {
            Privilege::User => EVTSEL_USR,
            Privilege::Kernel => EVTSEL_OS,
            Privilege::All => EVTSEL_USR | EVTSEL_OS,
        }
    }
}

impl FromStr for Privilege {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Privilege::User),
            "kernel" => Ok(Privilege::Kernel),
            "all" => Ok(Privilege::All),
            _ => Err(format!("unknown privilege level '{}'", s)),
        }
    }
}

/// Number of qualifying events between two consecutive samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFrequency(pub u64);

impl SampleFrequency {
    /// Longest period a counter seed can express: writes to IA32_PMCx keep
    /// bits 31:0 and sign-extend them
    pub const MAX: u64 = 1 << 31;

    /// The counter seed that overflows after exactly this many events
    pub fn reset_value(self) -> u64 {
        self.0.wrapping_neg()
    }
}

/// Configuration of one general-purpose counter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterConfig {
    pub event: Event,
    pub privilege: Privilege,
    /// Value loaded into the counter at start and after every sample
    pub reset: u64,
    pub enabled: bool,
}

impl CounterConfig {
    /// An enabled slot sampling every `frequency` occurrences of `event`
    pub fn sampling(event: Event, frequency: SampleFrequency) -> Self {
        CounterConfig {
            event,
            privilege: Privilege::All,
            reset: frequency.reset_value(),
            enabled: true,
        }
    }

    pub const fn disabled() -> Self {
        CounterConfig {
            event: Event::new(0, 0),
            privilege: Privilege::All,
            reset: 0,
            enabled: false,
        }
    }

    pub fn with_privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    /// IA32_PERFEVTSELx value for this slot
    pub fn event_select(&self) -> u64 {
        u64::from(self.event.code)
            | u64::from(self.event.umask) << 8
            | self.privilege.bits()
            | EVTSEL_EN
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Builds the four-slot array from `(slot, config)` pairs
pub fn counters(slots: &[(usize, CounterConfig)]) -> [CounterConfig; NUM_COUNTERS] {
    let mut out = [CounterConfig::disabled(); NUM_COUNTERS];
    for &(slot, config) in slots {
        if slot < NUM_COUNTERS {
            out[slot] = config;
        }
    }
    out
}

/// Bit `i` set for every enabled slot `i`
pub fn enabled_mask(counters: &[CounterConfig; NUM_COUNTERS]) -> u64 {
    counters
        .iter()
        .enumerate()
        .filter(|(_, c)| c.enabled)
        .fold(0, |mask, (i, _)| mask | 1 << i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use msr::registers::COUNTER_MASK;
    use rstest::rstest;

    #[test]
    fn test_event_encoding() {
        let e = Event::MEM_LOAD_L2_MISS;
        assert_eq!(e.code, 0xd1);
        assert_eq!(e.umask, 0x10);
        assert_eq!(e.raw(), 0x10d1);
        assert_eq!(e.to_string(), "0x10d1");
    }

    #[rstest]
    #[case("mem-load-l2-miss", Event::MEM_LOAD_L2_MISS)]
    #[case("llc-misses", Event::LLC_MISSES)]
    #[case("0x02cd", Event::PRECISE_STORE)]
    #[case("c4", Event::BRANCH_INSTRUCTIONS)]
    fn test_parse_event(#[case] input: &str, #[case] expected: Event) {
        assert_eq!(input.parse::<Event>().unwrap(), expected);
    }

    #[test]
    fn test_parse_unknown_event() {
        assert!("cache-thrash".parse::<Event>().is_err());
    }

    #[rstest]
    #[case(100)]
    #[case(1000)]
    #[case(100003)]
    fn test_reset_value_overflows_after_period(#[case] period: u64) {
        let reset = SampleFrequency(period).reset_value() & COUNTER_MASK;
        // Counting `period` events takes the 48-bit counter exactly to wrap
        assert_eq!((reset + period) & COUNTER_MASK, 0);
        assert_ne!((reset + period - 1) & COUNTER_MASK, 0);
    }

    #[rstest]
    #[case(1)]
    #[case(SampleFrequency::MAX)]
    fn test_reset_value_survives_legacy_write(#[case] period: u64) {
        let reset = SampleFrequency(period).reset_value();
        // The counter keeps the low 32 bits, sign-extended
        let stored = (reset as u32 as i32 as i64 as u64) & COUNTER_MASK;
        assert_eq!(stored, reset & COUNTER_MASK);

        let too_long = SampleFrequency(SampleFrequency::MAX + 1).reset_value();
        assert_ne!((too_long as u32 as i32 as i64 as u64) & COUNTER_MASK, too_long & COUNTER_MASK);
    }

    #[test]
    fn test_event_select_bits() {
        let config = CounterConfig::sampling(Event::MEM_LOAD_L2_MISS, SampleFrequency(100));
        // code, umask, USR, OS, EN; matches the classic 0x4310d1 encoding
        assert_eq!(config.event_select(), 0x4310d1);

        let user = config.with_privilege(Privilege::User);
        assert_eq!(user.event_select(), 0x4110d1);

        let kernel = config.with_privilege(Privilege::Kernel);
        assert_eq!(kernel.event_select(), 0x4210d1);
    }

    #[test]
    fn test_parse_privilege() {
        assert_eq!("user".parse::<Privilege>().unwrap(), Privilege::User);
        assert_eq!("all".parse::<Privilege>().unwrap(), Privilege::All);
        assert!("ring0".parse::<Privilege>().is_err());
    }

    #[test]
    fn test_enabled_mask() {
        let sampling = CounterConfig::sampling(Event::LLC_MISSES, SampleFrequency(1000));
        assert_eq!(enabled_mask(&counters(&[])), 0);
        assert_eq!(enabled_mask(&counters(&[(0, sampling)])), 0b0001);
        assert_eq!(enabled_mask(&counters(&[(1, sampling), (3, sampling)])), 0b1010);
        // Out of range slots are ignored
        assert_eq!(enabled_mask(&counters(&[(7, sampling)])), 0);
    }
}
