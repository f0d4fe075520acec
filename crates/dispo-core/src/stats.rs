use crate::user::Roster;

const RECENT_USERS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentUser {
    pub id: String,
    pub username: String,
    pub selections: usize,
}

/// Dashboard counters over the whole roster. The user filter does not apply
/// here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_active_users: usize,
    pub total_selections: usize,
    pub your_selections: usize,
    /// The last users in roster order, most recent sign-ups last.
    pub recent: Vec<RecentUser>,
}

impl Stats {
    pub fn compute(roster: &Roster, current_user_id: &str) -> Self {
        let users = roster.users();
        let skip = users.len().saturating_sub(RECENT_USERS);

        Self {
            total_active_users: users.len(),
            total_selections: users.iter().map(|u| u.selections.len()).sum(),
            your_selections: roster
                .get(current_user_id)
                .map(|u| u.selections.len())
                .unwrap_or(0),
            recent: users[skip..]
                .iter()
                .map(|u| RecentUser {
                    id: u.id.clone(),
                    username: u.username.clone(),
                    selections: u.selections.len(),
                })
                .collect(),
        }
    }
}

/// Stable per-user colour: hue from the sum of the id's character codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserColour {
    pub hue: u16,
}

pub fn user_colour(id: &str) -> UserColour {
    let sum: u64 = id.chars().map(|c| u64::from(u32::from(c))).sum();
    UserColour {
        hue: (sum % 360) as u16,
    }
}

impl UserColour {
    /// RGB for `hsl(hue, 70%, 60%)`.
    pub fn rgb(self) -> (u8, u8, u8) {
        let (s, l) = (0.7_f64, 0.6_f64);
        let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
        let h = f64::from(self.hue) / 60.0;
        let x = c * (1.0 - (h % 2.0 - 1.0).abs());
        let (r, g, b) = match self.hue {
            0..60 => (c, x, 0.0),
            60..120 => (x, c, 0.0),
            120..180 => (0.0, c, x),
            180..240 => (0.0, x, c),
            240..300 => (x, 0.0, c),
            _ => (c, 0.0, x),
        };
        let m = l - c / 2.0;
        let channel = |v: f64| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;
        (channel(r), channel(g), channel(b))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::user::User;

    fn user(id: &str, dates: &[&str]) -> User {
        let mut user = User::new(id.to_string(), String::new(), String::new(), Utc::now());
        user.id = id.to_string();
        user.selections = dates.iter().map(|d| d.to_string()).collect();
        user
    }

    #[test]
    fn totals_and_recent_users() {
        let roster = Roster::new(vec![
            user("u1", &["2024-03-01"]),
            user("u2", &["2024-03-01", "2024-03-02"]),
            user("u3", &[]),
            user("u4", &["2024-03-05"]),
        ]);
        let stats = Stats::compute(&roster, "u2");

        assert_eq!(stats.total_active_users, 4);
        assert_eq!(stats.total_selections, 4);
        assert_eq!(stats.your_selections, 2);
        let recent: Vec<&str> = stats.recent.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(recent, vec!["u2", "u3", "u4"]);
    }

    #[test]
    fn empty_roster_and_unknown_user() {
        let stats = Stats::compute(&Roster::default(), "ghost");
        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn colour_is_stable_per_id() {
        // 'a' + 'b' = 97 + 98
        assert_eq!(user_colour("ab").hue, 195);
        assert_eq!(user_colour("ab"), user_colour("ab"));
        assert_eq!(UserColour { hue: 0 }.rgb(), (224, 82, 82));
    }
}
