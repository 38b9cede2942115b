//! Identifiers, roles and status vocabularies shared across the engine
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::str::FromStr;

pub type FormId = u64;
pub type RecordId = u64;
pub type UserId = u64;
pub type VoucherId = u64;
pub type LogId = u64;
pub type SplitId = u64;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Into::into)
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

/// Role of an authenticated actor, resolved at the perimeter.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    #[n(0)]
    Employee,
    #[n(1)]
    Finance,
    #[n(2)]
    Manager,
}

/// The two approval stages. Finance reviews first, the manager second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStage {
    Finance,
    Manager,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormStatus {
    #[n(0)]
    Draft,
    #[n(1)]
    Submitted,
    #[n(2)]
    FinanceApproved,
    #[n(3)]
    FinanceRejected,
    #[n(4)]
    ManagerApproved,
    #[n(5)]
    ManagerRejected,
    #[n(6)]
    Paid,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    FinanceApproved,
    #[n(2)]
    FinanceRejected,
    #[n(3)]
    ManagerApproved,
    #[n(4)]
    ManagerRejected,
}

/// An already authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(id: UserId, role: Role) -> Self {
        Self { id, role }
    }
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Employee => "employee",
            Role::Finance => "finance",
            Role::Manager => "manager",
        }
    }
    /// `None` for roles that cannot approve anything.
    pub fn stage(&self) -> Option<ApprovalStage> {
        match self {
            Role::Employee => None,
            Role::Finance => Some(ApprovalStage::Finance),
            Role::Manager => Some(ApprovalStage::Manager),
        }
    }
}

impl ApprovalStage {
    pub fn role(&self) -> Role {
        match self {
            ApprovalStage::Finance => Role::Finance,
            ApprovalStage::Manager => Role::Manager,
        }
    }
    pub fn may_decide(&self, status: FormStatus) -> bool {
        match self {
            ApprovalStage::Finance => {
                matches!(status, FormStatus::Draft | FormStatus::Submitted)
            }
            ApprovalStage::Manager => status == FormStatus::FinanceApproved,
        }
    }
    pub fn approved_status(&self) -> FormStatus {
        match self {
            ApprovalStage::Finance => FormStatus::FinanceApproved,
            ApprovalStage::Manager => FormStatus::ManagerApproved,
        }
    }
    pub fn rejected_status(&self) -> FormStatus {
        match self {
            ApprovalStage::Finance => FormStatus::FinanceRejected,
            ApprovalStage::Manager => FormStatus::ManagerRejected,
        }
    }
    pub fn approved_record_status(&self) -> RecordStatus {
        match self {
            ApprovalStage::Finance => RecordStatus::FinanceApproved,
            ApprovalStage::Manager => RecordStatus::ManagerApproved,
        }
    }
    pub fn rejected_record_status(&self) -> RecordStatus {
        match self {
            ApprovalStage::Finance => RecordStatus::FinanceRejected,
            ApprovalStage::Manager => RecordStatus::ManagerRejected,
        }
    }
}

impl FormStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FormStatus::Draft => "draft",
            FormStatus::Submitted => "submitted",
            FormStatus::FinanceApproved => "finance_approved",
            FormStatus::FinanceRejected => "finance_rejected",
            FormStatus::ManagerApproved => "manager_approved",
            FormStatus::ManagerRejected => "manager_rejected",
            FormStatus::Paid => "paid",
        }
    }
    pub fn is_rejected(&self) -> bool {
        matches!(self, FormStatus::FinanceRejected | FormStatus::ManagerRejected)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for FormStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "employee" | "user" => Ok(Role::Employee),
            "finance" => Ok(Role::Finance),
            "manager" => Ok(Role::Manager),
            other => Err(anyhow::anyhow!("unknown role: {other}")),
        }
    }
}
