use chrono::Weekday;

use crate::settings::Language;

const MONTHS_FR: [&str; 12] = [
    "Janvier",
    "Février",
    "Mars",
    "Avril",
    "Mai",
    "Juin",
    "Juillet",
    "Août",
    "Septembre",
    "Octobre",
    "Novembre",
    "Décembre",
];

const MONTHS_EN: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

/// User-facing strings the CLI prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Calendar,
    Statistics,
    Settings,
    Profile,
    Welcome,
    TotalActiveUsers,
    SelectedSlots,
    YourSelections,
    RecentActivity,
    SelectedBy,
    MostPopular,
    Filter,
    UsersVisible,
    SelectAll,
    DeselectAll,
    Language,
    Theme,
    BlueNight,
    Anthracite,
    LoginSuccess,
    RegisterSuccess,
    Logout,
    ProfileUpdated,
    PasswordUpdated,
    SettingsUpdated,
    AccountDeleted,
    NoSelections,
}

pub fn label(key: Label, lang: Language) -> &'static str {
    match lang {
        Language::Fr => match key {
            Label::Calendar => "Calendrier",
            Label::Statistics => "Statistiques",
            Label::Settings => "Paramètres",
            Label::Profile => "Profil",
            Label::Welcome => "Bienvenue",
            Label::TotalActiveUsers => "Utilisateurs actifs",
            Label::SelectedSlots => "Créneaux sélectionnés",
            Label::YourSelections => "Vos sélections",
            Label::RecentActivity => "Activité récente",
            Label::SelectedBy => "Sélectionné par",
            Label::MostPopular => "Plus populaire",
            Label::Filter => "Filtre",
            Label::UsersVisible => "utilisateurs visibles",
            Label::SelectAll => "Tout sélectionner",
            Label::DeselectAll => "Tout désélectionner",
            Label::Language => "Langue",
            Label::Theme => "Thème",
            Label::BlueNight => "Nuit bleue",
            Label::Anthracite => "Gris anthracite",
            Label::LoginSuccess => "Connexion réussie !",
            Label::RegisterSuccess => "Compte créé avec succès !",
            Label::Logout => "Déconnexion",
            Label::ProfileUpdated => "Profil mis à jour avec succès",
            Label::PasswordUpdated => "Mot de passe mis à jour avec succès",
            Label::SettingsUpdated => "Paramètres sauvegardés",
            Label::AccountDeleted => "Compte supprimé avec succès",
            Label::NoSelections => "Aucune sélection",
        },
        Language::En => match key {
            Label::Calendar => "Calendar",
            Label::Statistics => "Statistics",
            Label::Settings => "Settings",
            Label::Profile => "Profile",
            Label::Welcome => "Welcome",
            Label::TotalActiveUsers => "Active Users",
            Label::SelectedSlots => "Selected Slots",
            Label::YourSelections => "Your Selections",
            Label::RecentActivity => "Recent Activity",
            Label::SelectedBy => "Selected by",
            Label::MostPopular => "Most popular",
            Label::Filter => "Filter",
            Label::UsersVisible => "users visible",
            Label::SelectAll => "Select all",
            Label::DeselectAll => "Deselect all",
            Label::Language => "Language",
            Label::Theme => "Theme",
            Label::BlueNight => "Blue Night",
            Label::Anthracite => "Anthracite Grey",
            Label::LoginSuccess => "Login successful!",
            Label::RegisterSuccess => "Account created successfully!",
            Label::Logout => "Logout",
            Label::ProfileUpdated => "Profile updated successfully",
            Label::PasswordUpdated => "Password updated successfully",
            Label::SettingsUpdated => "Settings saved",
            Label::AccountDeleted => "Account deleted successfully",
            Label::NoSelections => "No selections",
        },
    }
}

/// `month` is 1-based; out-of-range values yield an empty string.
pub fn month_name(month: u32, lang: Language) -> &'static str {
    let names = match lang {
        Language::Fr => &MONTHS_FR,
        Language::En => &MONTHS_EN,
    };
    month
        .checked_sub(1)
        .and_then(|idx| names.get(idx as usize))
        .copied()
        .unwrap_or("")
}

pub fn weekday_name(day: Weekday, lang: Language) -> &'static str {
    match (lang, day) {
        (Language::Fr, Weekday::Mon) => "Lundi",
        (Language::Fr, Weekday::Tue) => "Mardi",
        (Language::Fr, Weekday::Wed) => "Mercredi",
        (Language::Fr, Weekday::Thu) => "Jeudi",
        (Language::Fr, Weekday::Fri) => "Vendredi",
        (Language::Fr, Weekday::Sat) => "Samedi",
        (Language::Fr, Weekday::Sun) => "Dimanche",
        (Language::En, Weekday::Mon) => "Monday",
        (Language::En, Weekday::Tue) => "Tuesday",
        (Language::En, Weekday::Wed) => "Wednesday",
        (Language::En, Weekday::Thu) => "Thursday",
        (Language::En, Weekday::Fri) => "Friday",
        (Language::En, Weekday::Sat) => "Saturday",
        (Language::En, Weekday::Sun) => "Sunday",
    }
}

/// Three-letter column header.
pub fn weekday_short(day: Weekday, lang: Language) -> String {
    weekday_name(day, lang).chars().take(3).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_names_cover_both_languages() {
        assert_eq!(month_name(2, Language::Fr), "Février");
        assert_eq!(month_name(12, Language::En), "December");
        assert_eq!(month_name(0, Language::En), "");
        assert_eq!(month_name(13, Language::Fr), "");
    }

    #[test]
    fn weekday_headers_are_three_letters() {
        assert_eq!(weekday_short(Weekday::Mon, Language::Fr), "Lun");
        assert_eq!(weekday_short(Weekday::Sun, Language::En), "Sun");
    }

    #[test]
    fn labels_differ_by_language() {
        assert_ne!(
            label(Label::MostPopular, Language::Fr),
            label(Label::MostPopular, Language::En)
        );
    }
}
