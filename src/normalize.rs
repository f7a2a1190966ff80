//! Coerces arbitrary JSON records into the canonical member, payment and
//! activity shapes.
//!
//! Input comes from hand-edited or older backups, so nothing here fails on a
//! wrong type: enumerated fields fall back to their default, numbers are
//! coerced and clamped, text fields take their default when absent. Only the
//! hard preconditions (a member name, a payment amount, an activity memberId)
//! reject a record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::{
    Activity, ActivityType, Member, MembershipStatus, Payment, PaymentMethod, PaymentState,
    PaymentStatus, RecordKind,
};

pub const REASON_NOT_OBJECT: &str = "not an object";
pub const REASON_MISSING_NAME: &str = "missing name";
pub const REASON_MISSING_AMOUNT: &str = "missing amount";
pub const REASON_MISSING_MEMBER_ID: &str = "missing memberId";

/// Clock and id source shared by every record of one import batch.
#[derive(Debug, Clone)]
pub struct BatchContext {
    now: DateTime<Utc>,
    tag: String,
}

impl BatchContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        let mut tag = Uuid::new_v4().simple().to_string();
        tag.truncate(8);
        Self { now, tag }
    }

    pub fn with_tag(now: DateTime<Utc>, tag: impl Into<String>) -> Self {
        Self {
            now,
            tag: tag.into(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// `imported_{kind}_{millis}_{tag}_{index}`. The random batch tag keeps two
    /// imports in the same millisecond from colliding.
    pub fn synth_id(&self, kind: RecordKind, index: usize) -> String {
        format!(
            "imported_{}_{}_{}_{}",
            kind.as_str(),
            self.now.timestamp_millis(),
            self.tag,
            index
        )
    }

    pub fn invoice_number(&self, index: usize) -> String {
        format!("INV-{}-{}", self.now.timestamp_millis(), index)
    }

    pub fn now_iso(&self) -> String {
        iso_millis(self.now)
    }

    pub fn today(&self) -> String {
        self.now.format("%Y-%m-%d").to_string()
    }
}

/// `2026-01-31T09:15:00.000Z`, the format browsers emit for `toISOString()`.
pub fn iso_millis(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn normalize_member(raw: &Value, index: usize, ctx: &BatchContext) -> Result<Member, String> {
    let obj = raw.as_object().ok_or(REASON_NOT_OBJECT)?;
    let name = match text(obj, "name").map(|n| n.trim().to_string()) {
        Some(n) if !n.is_empty() => n,
        _ => return Err(REASON_MISSING_NAME.to_string()),
    };

    Ok(Member {
        id: text(obj, "id").unwrap_or_else(|| ctx.synth_id(RecordKind::Member, index)),
        name,
        membership_status: MembershipStatus::parse_or_default(obj.get("membershipStatus")),
        last_attendance: text(obj, "lastAttendance").unwrap_or_else(|| ctx.today()),
        image_url: text(obj, "imageUrl")
            .or_else(|| text(obj, "profileImage"))
            .unwrap_or_default(),
        phone_number: text(obj, "phoneNumber")
            .or_else(|| text(obj, "phone"))
            .unwrap_or_default(),
        email: text(obj, "email").unwrap_or_default(),
        membership_type: text(obj, "membershipType").unwrap_or_default(),
        membership_start_date: text(obj, "membershipStartDate").unwrap_or_default(),
        membership_end_date: text(obj, "membershipEndDate").unwrap_or_default(),
        subscription_type: obj
            .get("subscriptionType")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        // Float to int casts saturate, so absurd inputs pin at u32::MAX.
        sessions_remaining: coerce_number(obj.get("sessionsRemaining")).trunc() as u32,
        subscription_price: coerce_number(obj.get("subscriptionPrice")),
        payment_status: PaymentStatus::parse_or_default(obj.get("paymentStatus")),
        note: text(obj, "note").unwrap_or_default(),
    })
}

pub fn normalize_payment(
    raw: &Value,
    index: usize,
    ctx: &BatchContext,
) -> Result<Payment, String> {
    let obj = raw.as_object().ok_or(REASON_NOT_OBJECT)?;
    match obj.get("amount") {
        None | Some(Value::Null) => return Err(REASON_MISSING_AMOUNT.to_string()),
        Some(_) => {}
    }

    Ok(Payment {
        id: text(obj, "id").unwrap_or_else(|| ctx.synth_id(RecordKind::Payment, index)),
        member_id: text(obj, "memberId").unwrap_or_else(|| "unknown".to_string()),
        amount: coerce_number(obj.get("amount")),
        date: text(obj, "date").unwrap_or_else(|| ctx.now_iso()),
        subscription_type: text(obj, "subscriptionType")
            .unwrap_or_else(|| "unspecified".to_string()),
        payment_method: PaymentMethod::parse_or_default(obj.get("paymentMethod")),
        status: PaymentState::parse_or_default(obj.get("status")),
        invoice_number: text(obj, "invoiceNumber").unwrap_or_else(|| ctx.invoice_number(index)),
        notes: text(obj, "notes").unwrap_or_default(),
        receipt_url: text(obj, "receiptUrl").unwrap_or_default(),
    })
}

/// Activities without a memberId are dropped, not reported.
pub fn normalize_activity(raw: &Value, index: usize, ctx: &BatchContext) -> Option<Activity> {
    let obj = raw.as_object()?;
    let member_id = text(obj, "memberId")?;

    Some(Activity {
        id: text(obj, "id").unwrap_or_else(|| ctx.synth_id(RecordKind::Activity, index)),
        member_id,
        member_name: text(obj, "memberName").unwrap_or_default(),
        member_image: text(obj, "memberImage").unwrap_or_default(),
        activity_type: ActivityType::parse_or_default(obj.get("activityType")),
        timestamp: text(obj, "timestamp").unwrap_or_else(|| ctx.now_iso()),
        details: text(obj, "details").unwrap_or_default(),
    })
}

/// Normalizes one record of any kind into its canonical JSON form.
pub fn normalize_any(
    kind: RecordKind,
    raw: &Value,
    index: usize,
    ctx: &BatchContext,
) -> Result<(String, Value), String> {
    let (id, value) = match kind {
        RecordKind::Member => {
            let m = normalize_member(raw, index, ctx)?;
            (m.id.clone(), serde_json::to_value(m))
        }
        RecordKind::Payment => {
            let p = normalize_payment(raw, index, ctx)?;
            (p.id.clone(), serde_json::to_value(p))
        }
        RecordKind::Activity => {
            let a = normalize_activity(raw, index, ctx)
                .ok_or_else(|| REASON_MISSING_MEMBER_ID.to_string())?;
            (a.id.clone(), serde_json::to_value(a))
        }
    };
    let value = value.map_err(|e| e.to_string())?;
    Ok((id, value))
}

/// What a stored document would look like to the importer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordCheck {
    /// The importer would reject it.
    Corrupt(String),
    /// Accepted, but these fields would be coerced.
    Drifted(Vec<&'static str>),
    Clean,
}

pub fn check_record(kind: RecordKind, raw: &Value) -> RecordCheck {
    let Some(obj) = raw.as_object() else {
        return RecordCheck::Corrupt(REASON_NOT_OBJECT.to_string());
    };
    let ctx = BatchContext::with_tag(Utc::now(), "check");
    let accepted = match kind {
        RecordKind::Member => normalize_member(raw, 0, &ctx).map(|_| ()),
        RecordKind::Payment => normalize_payment(raw, 0, &ctx).map(|_| ()),
        RecordKind::Activity => normalize_activity(raw, 0, &ctx)
            .map(|_| ())
            .ok_or_else(|| REASON_MISSING_MEMBER_ID.to_string()),
    };
    if let Err(reason) = accepted {
        return RecordCheck::Corrupt(reason);
    }
    if text(obj, "id").is_none() {
        return RecordCheck::Corrupt("missing id".to_string());
    }

    let mut drifted = Vec::new();
    match kind {
        RecordKind::Member => {
            if !in_domain(obj, "membershipStatus", |s| MembershipStatus::parse(s).is_some()) {
                drifted.push("membershipStatus");
            }
            if !in_domain(obj, "paymentStatus", |s| PaymentStatus::parse(s).is_some()) {
                drifted.push("paymentStatus");
            }
            if !canonical_number(obj, "sessionsRemaining", true) {
                drifted.push("sessionsRemaining");
            }
            if !canonical_number(obj, "subscriptionPrice", false) {
                drifted.push("subscriptionPrice");
            }
        }
        RecordKind::Payment => {
            if !canonical_number(obj, "amount", false) {
                drifted.push("amount");
            }
            if !in_domain(obj, "paymentMethod", |s| PaymentMethod::parse(s).is_some()) {
                drifted.push("paymentMethod");
            }
            if !in_domain(obj, "status", |s| PaymentState::parse(s).is_some()) {
                drifted.push("status");
            }
        }
        RecordKind::Activity => {
            if !in_domain(obj, "activityType", |s| ActivityType::parse(s).is_some()) {
                drifted.push("activityType");
            }
        }
    }
    if drifted.is_empty() {
        RecordCheck::Clean
    } else {
        RecordCheck::Drifted(drifted)
    }
}

fn in_domain(obj: &Map<String, Value>, key: &str, valid: impl Fn(&str) -> bool) -> bool {
    obj.get(key).and_then(|v| v.as_str()).is_some_and(valid)
}

fn canonical_number(obj: &Map<String, Value>, key: &str, integer: bool) -> bool {
    match obj.get(key).and_then(|v| v.as_f64()) {
        Some(n) if n.is_finite() && n >= 0.0 => !integer || n.fract() == 0.0,
        _ => false,
    }
}

/// Present means a non-empty string or a non-zero number; everything else
/// takes the caller's default.
pub fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.as_f64().is_some_and(|f| f != 0.0) => Some(n.to_string()),
        _ => None,
    }
}

/// `Number(x) || 0`, then clamped to zero or above.
pub fn coerce_number(v: Option<&Value>) -> f64 {
    let n = match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => {
            let t = s.trim();
            if t.is_empty() {
                0.0
            } else {
                t.parse::<f64>().unwrap_or(0.0)
            }
        }
        Some(Value::Bool(true)) => 1.0,
        _ => 0.0,
    };
    if n.is_finite() && n > 0.0 {
        n
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ctx() -> BatchContext {
        let now = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        BatchContext::with_tag(now, "t1")
    }

    #[test]
    fn member_defaults_fill_every_field() {
        let m = normalize_member(&json!({ "name": "  Sara  " }), 3, &ctx()).expect("member");
        assert_eq!(m.name, "Sara");
        assert_eq!(m.id, "imported_member_1773480600000_t1_3");
        assert_eq!(m.membership_status, MembershipStatus::Pending);
        assert_eq!(m.payment_status, PaymentStatus::Unpaid);
        assert_eq!(m.last_attendance, "2026-03-14");
        assert_eq!(m.sessions_remaining, 0);
        assert_eq!(m.subscription_price, 0.0);
        assert_eq!(m.subscription_type, None);
        assert_eq!(m.phone_number, "");
    }

    #[test]
    fn member_without_usable_name_is_rejected() {
        let c = ctx();
        for raw in [
            json!({}),
            json!({ "name": "   " }),
            json!({ "name": 0 }),
            json!({ "name": null }),
            json!({ "name": ["Sara"] }),
        ] {
            assert_eq!(
                normalize_member(&raw, 0, &c).unwrap_err(),
                REASON_MISSING_NAME,
                "{raw}"
            );
        }
        assert_eq!(
            normalize_member(&json!("Sara"), 0, &c).unwrap_err(),
            REASON_NOT_OBJECT
        );
    }

    #[test]
    fn numeric_member_name_is_kept_as_text() {
        let m = normalize_member(&json!({ "name": 42 }), 0, &ctx()).expect("member");
        assert_eq!(m.name, "42");
        let m = normalize_member(&json!({ "name": 7.5 }), 0, &ctx()).expect("member");
        assert_eq!(m.name, "7.5");
    }

    #[test]
    fn member_numeric_fields_are_coerced_and_clamped() {
        let m = normalize_member(
            &json!({
                "name": "A",
                "sessionsRemaining": "-5",
                "subscriptionPrice": "1500",
            }),
            0,
            &ctx(),
        )
        .expect("member");
        assert_eq!(m.sessions_remaining, 0);
        assert_eq!(m.subscription_price, 1500.0);

        let m = normalize_member(
            &json!({ "name": "A", "sessionsRemaining": 7.9, "subscriptionPrice": "abc" }),
            0,
            &ctx(),
        )
        .expect("member");
        assert_eq!(m.sessions_remaining, 7);
        assert_eq!(m.subscription_price, 0.0);
    }

    #[test]
    fn member_legacy_contact_fields_are_picked_up() {
        let m = normalize_member(
            &json!({ "name": "A", "phone": "0555", "profileImage": "data:img" }),
            0,
            &ctx(),
        )
        .expect("member");
        assert_eq!(m.phone_number, "0555");
        assert_eq!(m.image_url, "data:img");
    }

    #[test]
    fn member_enums_outside_domain_fall_back() {
        let m = normalize_member(
            &json!({ "name": "A", "membershipStatus": "ACTIVE", "paymentStatus": "refunded" }),
            0,
            &ctx(),
        )
        .expect("member");
        assert_eq!(m.membership_status, MembershipStatus::Pending);
        assert_eq!(m.payment_status, PaymentStatus::Unpaid);
    }

    #[test]
    fn payment_defaults_and_coercions() {
        let p = normalize_payment(
            &json!({ "amount": -20, "paymentMethod": "bitcoin", "status": "weird" }),
            4,
            &ctx(),
        )
        .expect("payment");
        assert_eq!(p.amount, 0.0);
        assert_eq!(p.member_id, "unknown");
        assert_eq!(p.payment_method, PaymentMethod::Cash);
        assert_eq!(p.status, PaymentState::Completed);
        assert_eq!(p.subscription_type, "unspecified");
        assert_eq!(p.invoice_number, "INV-1773480600000-4");
        assert_eq!(p.date, "2026-03-14T09:30:00.000Z");
    }

    #[test]
    fn payment_amount_must_be_present() {
        let c = ctx();
        assert_eq!(
            normalize_payment(&json!({ "memberId": "m1" }), 0, &c).unwrap_err(),
            REASON_MISSING_AMOUNT
        );
        assert_eq!(
            normalize_payment(&json!({ "amount": null }), 0, &c).unwrap_err(),
            REASON_MISSING_AMOUNT
        );
        let p = normalize_payment(&json!({ "amount": "not money" }), 0, &c).expect("payment");
        assert_eq!(p.amount, 0.0);
    }

    #[test]
    fn activity_without_member_is_dropped() {
        let c = ctx();
        assert!(normalize_activity(&json!({ "activityType": "check-in" }), 0, &c).is_none());
        assert!(normalize_activity(&json!({ "memberId": "" }), 0, &c).is_none());
        assert!(normalize_activity(&json!(7), 0, &c).is_none());

        let a = normalize_activity(&json!({ "memberId": 12, "activityType": "dance" }), 2, &c)
            .expect("activity");
        assert_eq!(a.member_id, "12");
        assert_eq!(a.activity_type, ActivityType::Other);
        assert_eq!(a.id, "imported_activity_1773480600000_t1_2");
    }

    #[test]
    fn existing_ids_are_kept() {
        let m = normalize_member(&json!({ "id": "m-1", "name": "A" }), 0, &ctx()).expect("m");
        assert_eq!(m.id, "m-1");
    }

    #[test]
    fn canonical_member_survives_a_second_pass() {
        let c = ctx();
        let first = normalize_member(
            &json!({ "name": "A", "sessionsRemaining": 3, "membershipStatus": "active" }),
            0,
            &c,
        )
        .expect("first");
        let again = normalize_member(&serde_json::to_value(&first).unwrap(), 9, &c).expect("again");
        assert_eq!(first, again);
        assert_eq!(
            check_record(RecordKind::Member, &serde_json::to_value(&first).unwrap()),
            RecordCheck::Clean
        );
    }

    #[test]
    fn check_record_reports_drift_and_corruption() {
        assert_eq!(
            check_record(RecordKind::Payment, &json!({ "id": "p", "memberId": "m" })),
            RecordCheck::Corrupt(REASON_MISSING_AMOUNT.to_string())
        );
        assert_eq!(
            check_record(RecordKind::Member, &json!({ "name": "A" })),
            RecordCheck::Corrupt("missing id".to_string())
        );
        assert_eq!(
            check_record(
                RecordKind::Payment,
                &json!({ "id": "p", "amount": "10", "paymentMethod": "card", "status": "pending" })
            ),
            RecordCheck::Drifted(vec!["amount"])
        );
    }
}
