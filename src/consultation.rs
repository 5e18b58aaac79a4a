/// Pipeline stage of an admission consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsultationStatus {
    New,
    Scheduled,
    Enrolled,
    Rejected,
    OnHold,
    Waitlist,
}

impl ConsultationStatus {
    pub const ALL: [ConsultationStatus; 6] = [
        Self::New,
        Self::Scheduled,
        Self::Enrolled,
        Self::Rejected,
        Self::OnHold,
        Self::Waitlist,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "scheduled" => Some(Self::Scheduled),
            "enrolled" => Some(Self::Enrolled),
            "rejected" => Some(Self::Rejected),
            "on_hold" => Some(Self::OnHold),
            "waitlist" => Some(Self::Waitlist),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Scheduled => "scheduled",
            Self::Enrolled => "enrolled",
            Self::Rejected => "rejected",
            Self::OnHold => "on_hold",
            Self::Waitlist => "waitlist",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::New => "신규",
            Self::Scheduled => "상담예정",
            Self::Enrolled => "등록완료",
            Self::Rejected => "미등록",
            Self::OnHold => "보류",
            Self::Waitlist => "대기",
        }
    }
}

/// What a status change must do besides writing the new status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPlan {
    pub needs_confirmation: bool,
    pub stamp_enrolled_date: bool,
    pub leave_waitlists: bool,
    pub join_waitlist: bool,
}

impl ConsultationStatus {
    /// Statuses that are only reachable through a confirmed status change.
    pub fn is_guarded(self) -> bool {
        matches!(self, Self::Enrolled | Self::Waitlist)
    }
}

/// Plans a move to `to`. Entering a guarded status and joining any waitlist
/// are confirmed moves; every status other than `waitlist` drops the
/// consultation from its waitlists.
pub fn plan_transition(
    from: ConsultationStatus,
    to: ConsultationStatus,
    has_waitlist_target: bool,
) -> TransitionPlan {
    let join_waitlist = to == ConsultationStatus::Waitlist && has_waitlist_target;
    TransitionPlan {
        needs_confirmation: (to.is_guarded() && from != to) || join_waitlist,
        stamp_enrolled_date: to == ConsultationStatus::Enrolled,
        leave_waitlists: to != ConsultationStatus::Waitlist,
        join_waitlist,
    }
}

pub fn valid_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_round_trips_through_its_wire_name() {
        for s in ConsultationStatus::ALL {
            assert_eq!(ConsultationStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ConsultationStatus::parse("done"), None);
    }

    #[test]
    fn enrol_and_waitlist_need_confirmation() {
        use ConsultationStatus::*;
        assert!(plan_transition(New, Enrolled, false).needs_confirmation);
        assert!(plan_transition(Scheduled, Waitlist, true).needs_confirmation);
        assert!(!plan_transition(New, Scheduled, false).needs_confirmation);
        assert!(!plan_transition(Enrolled, Enrolled, false).needs_confirmation);
    }

    #[test]
    fn joining_another_waitlist_is_confirmed_even_when_already_waitlisted() {
        use ConsultationStatus::*;
        assert!(plan_transition(Waitlist, Waitlist, true).needs_confirmation);
        assert!(!plan_transition(Waitlist, Waitlist, false).needs_confirmation);
        assert!(Enrolled.is_guarded() && Waitlist.is_guarded());
        assert!(!OnHold.is_guarded());
    }

    #[test]
    fn leaving_waitlist_clears_memberships() {
        use ConsultationStatus::*;
        let p = plan_transition(Waitlist, Rejected, false);
        assert!(p.leave_waitlists);
        assert!(!p.join_waitlist);

        let p = plan_transition(New, Waitlist, true);
        assert!(!p.leave_waitlists);
        assert!(p.join_waitlist);
        assert!(!plan_transition(New, Waitlist, false).join_waitlist);
    }

    #[test]
    fn email_check_is_shape_only() {
        assert!(valid_email("parent@example.com"));
        assert!(!valid_email("parent.example.com"));
        assert!(!valid_email("a@b"));
        assert!(!valid_email("a b@c.com"));
    }
}
