//! Binding state arbitration.
//!
//! When the partner sends a binding update, the local server decides
//! whether to take the partner's view of the lease. Two rule sets apply:
//! the normal rules while cooperating, and the more permissive conflict
//! rules while resolving a potential conflict. Both return the binding
//! state the lease should end up in; anything other than the proposed
//! state means the update is refused.

use tracing::error;

use crate::lease::Lease;
use crate::state::{BindingState, Role, ServiceState};

/// Allowance for clock skew between the partners plus a fudge factor.
pub const EXPIRY_FUDGE_SECONDS: i64 = 65;

/// Checks a partner-proposed transition while in the normal state.
///
/// `tsfp` is the potential expiry the partner claims for the lease.
pub fn check_normal(
    lease: &Lease,
    role: Role,
    proposed: BindingState,
    tsfp: i64,
    now: i64,
) -> BindingState {
    use BindingState::*;

    let current = lease.binding_state;
    if proposed == current {
        return proposed;
    }

    let agreed_expired = tsfp <= now;

    match current {
        // Free leases belong to the primary. A secondary moving one is
        // already out of step, so take its word but complain.
        Free | Abandoned => {
            if role == Role::Primary && proposed != Free {
                error!(
                    "{}: secondary moved a {} lease to {}",
                    lease.ip_address, current, proposed
                );
            }
            proposed
        }

        Active => match role {
            Role::Primary if proposed == Released => proposed,
            Role::Primary => current,
            Role::Secondary => match proposed {
                Free | Backup if !agreed_expired => current,
                Expired if lease.ends - EXPIRY_FUDGE_SECONDS > now => current,
                Free | Backup | Expired | Released | Abandoned | Reset | Active => proposed,
            },
        },

        Expired | Reset => match proposed {
            Free | Backup if !agreed_expired => current,
            Free | Backup | Active | Released | Abandoned | Reset | Expired => proposed,
        },

        Released => proposed,

        // Backup leases belong to the secondary.
        Backup => {
            if role == Role::Secondary && proposed != Free {
                error!(
                    "{}: primary moved a {} lease to {}",
                    lease.ip_address, current, proposed
                );
            }
            proposed
        }
    }
}

/// Checks a partner-proposed transition while resolving a conflict.
pub fn check_conflict(lease: &Lease, proposed: BindingState, now: i64) -> BindingState {
    use BindingState::*;

    let current = lease.binding_state;
    if proposed == current {
        return proposed;
    }

    match current {
        Free | Abandoned | Expired | Released | Reset | Backup => proposed,
        Active => match proposed {
            Free | Backup => current,
            Expired if lease.ends - EXPIRY_FUDGE_SECONDS > now => current,
            Expired | Released | Reset | Abandoned | Active => proposed,
        },
    }
}

/// Decides a dueling update: both sides changed the same lease and
/// neither change has been acknowledged. Returns true if the local change
/// wins and the partner's update must be refused.
///
/// Between two active bindings the earlier client last transaction time
/// wins, the primary breaking exact ties. An active binding beats any
/// other state; otherwise the primary wins.
pub fn local_update_wins(
    lease: &Lease,
    role: Role,
    proposed: BindingState,
    peer_cltt: Option<i64>,
) -> bool {
    use BindingState::*;

    let local = if lease.binding_state != lease.desired_binding_state {
        lease.desired_binding_state
    } else {
        lease.binding_state
    };
    let peer_cltt = peer_cltt.unwrap_or(0);

    if local == Active {
        match proposed {
            Active => {
                return match lease.cltt.cmp(&peer_cltt) {
                    std::cmp::Ordering::Less => true,
                    std::cmp::Ordering::Greater => false,
                    std::cmp::Ordering::Equal => role == Role::Primary,
                };
            }
            Expired => return false,
            Free | Backup | Released | Abandoned | Reset => {}
        }
    }

    match proposed {
        Active => false,
        Free | Backup | Expired | Released | Abandoned | Reset => role == Role::Primary,
    }
}

/// Whether this server may hand the lease to a client right now.
///
/// Besides the usual ownership rules (free leases are the primary's,
/// backup leases the secondary's), a server in partner-down may take the
/// partner's leases once MCLT has passed since it could last have used
/// them.
pub fn lease_mine_to_reallocate(
    lease: &Lease,
    role: Role,
    service: ServiceState,
    stos: i64,
    mclt: i64,
    now: i64,
) -> bool {
    use BindingState::*;

    let partner_down = service == ServiceState::PartnerDown;
    let partner_window_passed = if lease.tsfp < stos {
        stos + mclt < now
    } else {
        lease.tsfp + mclt < now
    };

    match lease.binding_state {
        Active => false,
        Free | Abandoned => role == Role::Primary || (partner_down && partner_window_passed),
        Backup => role == Role::Secondary || (partner_down && partner_window_passed),
        Released | Expired
            if (role == Role::Primary && lease.rewind_binding_state == Free)
                || (role == Role::Secondary && lease.rewind_binding_state == Backup) =>
        {
            true
        }
        Released | Expired | Reset => partner_down && lease.tsfp < now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::PoolId;
    use std::net::Ipv4Addr;

    const NOW: i64 = 1_700_000_000;

    fn lease(state: BindingState) -> Lease {
        let mut lease = Lease::new(Ipv4Addr::new(10, 0, 0, 9), PoolId(0));
        lease.binding_state = state;
        lease.desired_binding_state = state;
        lease
    }

    #[test]
    fn test_no_change_always_accepted() {
        for state in [BindingState::Active, BindingState::Backup, BindingState::Free] {
            assert_eq!(check_normal(&lease(state), Role::Primary, state, NOW + 100, NOW), state);
        }
    }

    #[test]
    fn test_free_accepts_anything() {
        let free = lease(BindingState::Free);
        for role in [Role::Primary, Role::Secondary] {
            assert_eq!(
                check_normal(&free, role, BindingState::Active, NOW, NOW),
                BindingState::Active
            );
        }
    }

    #[test]
    fn test_active_on_primary_only_accepts_release() {
        let active = lease(BindingState::Active);
        assert_eq!(
            check_normal(&active, Role::Primary, BindingState::Released, NOW, NOW),
            BindingState::Released
        );
        assert_eq!(
            check_normal(&active, Role::Primary, BindingState::Free, NOW - 10, NOW),
            BindingState::Active
        );
    }

    #[test]
    fn test_active_on_secondary_waits_for_potential_expiry() {
        let mut active = lease(BindingState::Active);
        assert_eq!(
            check_normal(&active, Role::Secondary, BindingState::Free, NOW + 60, NOW),
            BindingState::Active
        );
        assert_eq!(
            check_normal(&active, Role::Secondary, BindingState::Free, NOW, NOW),
            BindingState::Free
        );

        active.ends = NOW + 66;
        assert_eq!(
            check_normal(&active, Role::Secondary, BindingState::Expired, NOW, NOW),
            BindingState::Active
        );
        active.ends = NOW + 65;
        assert_eq!(
            check_normal(&active, Role::Secondary, BindingState::Expired, NOW, NOW),
            BindingState::Expired
        );
    }

    #[test]
    fn test_expired_to_free_requires_tsfp() {
        let expired = lease(BindingState::Expired);
        assert_eq!(
            check_normal(&expired, Role::Secondary, BindingState::Free, NOW + 1, NOW),
            BindingState::Expired
        );
        assert_eq!(
            check_normal(&expired, Role::Secondary, BindingState::Backup, NOW - 1, NOW),
            BindingState::Backup
        );
    }

    #[test]
    fn test_conflict_validator() {
        let mut active = lease(BindingState::Active);
        assert_eq!(
            check_conflict(&active, BindingState::Free, NOW),
            BindingState::Active
        );
        assert_eq!(
            check_conflict(&active, BindingState::Released, NOW),
            BindingState::Released
        );
        active.ends = NOW + 1000;
        assert_eq!(
            check_conflict(&active, BindingState::Expired, NOW),
            BindingState::Active
        );
        assert_eq!(
            check_conflict(&lease(BindingState::Backup), BindingState::Active, NOW),
            BindingState::Active
        );
    }

    #[test]
    fn test_dueling_earlier_cltt_wins() {
        let mut active = lease(BindingState::Active);
        active.cltt = NOW;
        assert!(local_update_wins(&active, Role::Secondary, BindingState::Active, Some(NOW + 5)));
        assert!(!local_update_wins(&active, Role::Primary, BindingState::Active, Some(NOW - 5)));
        assert!(local_update_wins(&active, Role::Primary, BindingState::Active, Some(NOW)));
        assert!(!local_update_wins(&active, Role::Secondary, BindingState::Active, Some(NOW)));
    }

    #[test]
    fn test_dueling_non_active() {
        let active = lease(BindingState::Active);
        assert!(!local_update_wins(&active, Role::Primary, BindingState::Expired, None));
        assert!(local_update_wins(&active, Role::Primary, BindingState::Released, None));

        let free = lease(BindingState::Free);
        assert!(!local_update_wins(&free, Role::Primary, BindingState::Active, None));
        assert!(local_update_wins(&free, Role::Primary, BindingState::Backup, None));
        assert!(!local_update_wins(&free, Role::Secondary, BindingState::Backup, None));
    }

    #[test]
    fn test_mine_to_reallocate() {
        let free = lease(BindingState::Free);
        assert!(lease_mine_to_reallocate(&free, Role::Primary, ServiceState::Cooperating, 0, 3600, NOW));
        assert!(!lease_mine_to_reallocate(&free, Role::Secondary, ServiceState::Cooperating, 0, 3600, NOW));
        assert!(lease_mine_to_reallocate(
            &free,
            Role::Secondary,
            ServiceState::PartnerDown,
            NOW - 4000,
            3600,
            NOW
        ));
        assert!(!lease_mine_to_reallocate(
            &free,
            Role::Secondary,
            ServiceState::PartnerDown,
            NOW - 100,
            3600,
            NOW
        ));

        let mut expired = lease(BindingState::Expired);
        expired.rewind_binding_state = BindingState::Free;
        assert!(lease_mine_to_reallocate(&expired, Role::Primary, ServiceState::NotCooperating, 0, 3600, NOW));
        expired.rewind_binding_state = BindingState::Active;
        assert!(!lease_mine_to_reallocate(&expired, Role::Primary, ServiceState::NotCooperating, 0, 3600, NOW));

        assert!(!lease_mine_to_reallocate(&lease(BindingState::Active), Role::Primary, ServiceState::PartnerDown, 0, 0, NOW));
    }
}
