use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Member,
    Payment,
    Activity,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [Self::Member, Self::Payment, Self::Activity];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "member" | "members" => Some(Self::Member),
            "payment" | "payments" => Some(Self::Payment),
            "activity" | "activities" => Some(Self::Activity),
            _ => None,
        }
    }

    /// Singular tag, used in synthesized ids and stored rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Payment => "payment",
            Self::Activity => "activity",
        }
    }

    /// Collection name as it appears in snapshots.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Member => "members",
            Self::Payment => "payments",
            Self::Activity => "activities",
        }
    }
}

/// Closed string domains. Unknown input falls back to the default instead of
/// failing.
macro_rules! string_enum {
    ($name:ident, default = $default:ident, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn parse_or_default(v: Option<&serde_json::Value>) -> Self {
                v.and_then(|v| v.as_str())
                    .and_then(Self::parse)
                    .unwrap_or_default()
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$default
            }
        }
    };
}

string_enum!(MembershipStatus, default = Pending, {
    Active => "active",
    Expired => "expired",
    Pending => "pending",
});

string_enum!(PaymentStatus, default = Unpaid, {
    Paid => "paid",
    Unpaid => "unpaid",
    Partial => "partial",
});

string_enum!(PaymentMethod, default = Cash, {
    Cash => "cash",
    Card => "card",
    Transfer => "transfer",
});

string_enum!(PaymentState, default = Completed, {
    Completed => "completed",
    Pending => "pending",
    Cancelled => "cancelled",
});

string_enum!(ActivityType, default = Other, {
    CheckIn => "check-in",
    MembershipRenewal => "membership-renewal",
    Payment => "payment",
    Other => "other",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub name: String,
    pub membership_status: MembershipStatus,
    pub last_attendance: String,
    pub image_url: String,
    pub phone_number: String,
    pub email: String,
    pub membership_type: String,
    pub membership_start_date: String,
    pub membership_end_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    pub sessions_remaining: u32,
    pub subscription_price: f64,
    pub payment_status: PaymentStatus,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub member_id: String,
    pub amount: f64,
    pub date: String,
    pub subscription_type: String,
    pub payment_method: PaymentMethod,
    pub status: PaymentState,
    pub invoice_number: String,
    pub notes: String,
    pub receipt_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub member_id: String,
    pub member_name: String,
    pub member_image: String,
    pub activity_type: ActivityType,
    pub timestamp: String,
    pub details: String,
}

/// A canonical record that can be written through the store's upsert.
pub trait Record: Serialize {
    const KIND: RecordKind;

    fn id(&self) -> &str;
}

impl Record for Member {
    const KIND: RecordKind = RecordKind::Member;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Payment {
    const KIND: RecordKind = RecordKind::Payment;

    fn id(&self) -> &str {
        &self.id
    }
}

impl Record for Activity {
    const KIND: RecordKind = RecordKind::Activity;

    fn id(&self) -> &str {
        &self.id
    }
}
