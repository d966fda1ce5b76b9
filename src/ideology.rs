//! Three-axis ideological/engagement profiling from network-session domain
//! categories and cohort-relative activity factors. The axis triple resolves
//! through an ordered rule list evaluated first-match-wins; the list keeps two
//! deliberately shadowed entries from the source heuristics rather than
//! merging them (see the dead-branch test).

use std::collections::BTreeMap;

use chrono::{NaiveDate, Timelike, Utc};
use tracing::info;
use uuid::Uuid;

use crate::baseline::CohortBaseline;
use crate::config::AnalysisConfig;
use crate::models::{Grade3, GradeRecord, NetworkSession, Polarity, ProfileRecord, StudentId};
use crate::stats;

/// Fixed domain taxonomy used to bucket visited domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DomainCategory {
    StudyResearch,
    Microblog,
    QaCommunity,
    ReviewCommunity,
    LifestyleFeed,
    ForumBoards,
    VideoCommunity,
    ShortVideoLive,
    NewsPortal,
    OverseasPlatform,
    AnonymousBoard,
    Other,
}

const TAXONOMY: &[(DomainCategory, &[&str])] = &[
    (
        DomainCategory::StudyResearch,
        &[
            "github.com",
            "csdn.net",
            "stackoverflow.com",
            "cnki.net",
            "wikipedia.org",
            "leetcode.com",
        ],
    ),
    (DomainCategory::Microblog, &["weibo.com"]),
    (DomainCategory::QaCommunity, &["zhihu.com"]),
    (DomainCategory::ReviewCommunity, &["douban.com"]),
    (DomainCategory::LifestyleFeed, &["xiaohongshu.com"]),
    (DomainCategory::ForumBoards, &["tieba.baidu.com"]),
    (DomainCategory::VideoCommunity, &["bilibili.com"]),
    (
        DomainCategory::ShortVideoLive,
        &["douyin.com", "kuaishou.com", "huya.com", "douyu.com"],
    ),
    (
        DomainCategory::NewsPortal,
        &["toutiao.com", "163.com", "qq.com"],
    ),
    (
        DomainCategory::OverseasPlatform,
        &["twitter.com", "youtube.com", "facebook.com", "google.com"],
    ),
    (
        DomainCategory::AnonymousBoard,
        &["treehole", "shudong", "comment"],
    ),
];

impl DomainCategory {
    pub fn classify(domain: &str) -> Self {
        if domain.is_empty() {
            return DomainCategory::Other;
        }
        let lowered = domain.to_ascii_lowercase();
        for (category, needles) in TAXONOMY {
            if needles.iter().any(|needle| lowered.contains(needle)) {
                return *category;
            }
        }
        DomainCategory::Other
    }

    pub fn label(&self) -> &'static str {
        match self {
            DomainCategory::StudyResearch => "study-research",
            DomainCategory::Microblog => "microblog",
            DomainCategory::QaCommunity => "qa-community",
            DomainCategory::ReviewCommunity => "review-community",
            DomainCategory::LifestyleFeed => "lifestyle-feed",
            DomainCategory::ForumBoards => "forum-boards",
            DomainCategory::VideoCommunity => "video-community",
            DomainCategory::ShortVideoLive => "short-video-live",
            DomainCategory::NewsPortal => "news-portal",
            DomainCategory::OverseasPlatform => "overseas-platform",
            DomainCategory::AnonymousBoard => "anonymous-board",
            DomainCategory::Other => "other",
        }
    }
}

/// Result of one ideology classification run.
#[derive(Debug, Clone)]
pub struct IdeologyAnalysis {
    pub profiles: Vec<ProfileRecord>,
    pub summary: IdeologySummary,
}

#[derive(Debug, Clone)]
pub struct IdeologySummary {
    pub run_id: Uuid,
    pub generated_at: chrono::NaiveDateTime,
    pub total_students: usize,
    /// Students whose strategy warrants close watch (strong radicalism or
    /// negative positivity).
    pub close_watch: usize,
}

/// Classify every student with network activity. Grade records contribute
/// only the stress proxy inside the radicalism axis.
pub fn classify_population(
    network: &[NetworkSession],
    grades: &[GradeRecord],
    config: &AnalysisConfig,
) -> IdeologyAnalysis {
    let baseline = CohortBaseline::from_sessions(network, config.night_start_hour);

    let mut sessions_by_student: BTreeMap<&str, Vec<&NetworkSession>> = BTreeMap::new();
    for session in network {
        sessions_by_student
            .entry(session.student_id.as_str())
            .or_default()
            .push(session);
    }
    let mut grades_by_student: BTreeMap<&str, Vec<&GradeRecord>> = BTreeMap::new();
    for record in grades {
        grades_by_student
            .entry(record.student_id.as_str())
            .or_default()
            .push(record);
    }

    let profiles: Vec<ProfileRecord> = sessions_by_student
        .iter()
        .map(|(student_id, sessions)| {
            let student_grades = grades_by_student
                .get(student_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            classify_student(student_id, sessions, student_grades, &baseline, config)
        })
        .collect();

    let close_watch = profiles
        .iter()
        .filter(|p| p.radicalism == Grade3::Strong || p.positivity == Polarity::Negative)
        .count();
    let summary = IdeologySummary {
        run_id: Uuid::new_v4(),
        generated_at: Utc::now().naive_utc(),
        total_students: profiles.len(),
        close_watch,
    };
    info!(
        total = summary.total_students,
        close_watch = summary.close_watch,
        "ideology classification complete"
    );

    IdeologyAnalysis { profiles, summary }
}

fn classify_student(
    student_id: &str,
    sessions: &[&NetworkSession],
    grades: &[&GradeRecord],
    baseline: &CohortBaseline,
    config: &AnalysisConfig,
) -> ProfileRecord {
    let proportions = category_proportions(sessions);
    let vpn_ratio = vpn_ratio(sessions);
    let daily_visits = daily_visits(sessions);

    let positivity = positivity_axis(&proportions, vpn_ratio, sessions, config);
    let intensity = intensity_axis(sessions, daily_visits, baseline, config);
    let radicalism = radicalism_axis(&proportions, vpn_ratio, grades, config);

    let (archetype, strategy) = resolve_profile(positivity, intensity, radicalism);
    let dominant = dominant_categories(sessions);
    let typical_scene = if dominant.is_empty() {
        "campus basics".to_string()
    } else {
        dominant.join("/")
    };

    ProfileRecord {
        student_id: StudentId::from(student_id),
        positivity,
        intensity,
        radicalism,
        archetype: archetype.to_string(),
        strategy: strategy.to_string(),
        typical_scene,
        dominant_categories: dominant,
        vpn_ratio,
        daily_visits,
    }
}

fn category_proportions(sessions: &[&NetworkSession]) -> BTreeMap<DomainCategory, f64> {
    let mut counts: BTreeMap<DomainCategory, usize> = BTreeMap::new();
    for session in sessions {
        *counts
            .entry(DomainCategory::classify(&session.domain))
            .or_default() += 1;
    }
    let total = sessions.len().max(1) as f64;
    counts
        .into_iter()
        .map(|(category, count)| (category, count as f64 / total))
        .collect()
}

fn vpn_ratio(sessions: &[&NetworkSession]) -> f64 {
    if sessions.is_empty() {
        return 0.0;
    }
    sessions.iter().filter(|s| s.used_vpn).count() as f64 / sessions.len() as f64
}

fn daily_visits(sessions: &[&NetworkSession]) -> f64 {
    let days: std::collections::BTreeSet<NaiveDate> =
        sessions.iter().map(|s| s.started_at.date()).collect();
    sessions.len() as f64 / days.len().max(1) as f64
}

/// Positivity: study/information categories add, short-video entertainment
/// and VPN/overseas usage subtract, domain diversity adds a small bonus.
fn positivity_axis(
    proportions: &BTreeMap<DomainCategory, f64>,
    vpn_ratio: f64,
    sessions: &[&NetworkSession],
    config: &AnalysisConfig,
) -> Polarity {
    if sessions.is_empty() {
        return Polarity::NotSignificant;
    }
    let p = |c: DomainCategory| proportions.get(&c).copied().unwrap_or(0.0);

    let mut score = 0.0;
    score += p(DomainCategory::StudyResearch) * 12.0;
    score += p(DomainCategory::NewsPortal) * 3.0;
    score -= p(DomainCategory::ShortVideoLive) * 4.0;
    score -= vpn_ratio * 10.0;
    score -= p(DomainCategory::OverseasPlatform) * 5.0;

    let distinct: std::collections::BTreeSet<&str> = sessions
        .iter()
        .filter(|s| !s.domain.is_empty())
        .map(|s| s.domain.as_str())
        .collect();
    score += (distinct.len().min(20) as f64 / 20.0) * 2.0;

    if score >= config.positivity_high {
        Polarity::Positive
    } else if score <= config.positivity_low {
        Polarity::Negative
    } else {
        Polarity::NotSignificant
    }
}

/// Intensity: 50/50 blend of cohort-relative visit frequency and
/// cohort-relative night-access ratio.
fn intensity_axis(
    sessions: &[&NetworkSession],
    daily_visits: f64,
    baseline: &CohortBaseline,
    config: &AnalysisConfig,
) -> Grade3 {
    if sessions.is_empty() {
        return Grade3::NotSignificant;
    }
    let count_factor = daily_visits / baseline.daily_visits;

    let night = sessions
        .iter()
        .filter(|s| {
            let hour = s.started_at.hour();
            hour >= config.night_start_hour || hour < 6
        })
        .count();
    let night_ratio = night as f64 / sessions.len() as f64;
    let night_factor = night_ratio / baseline.night_ratio;

    let score = count_factor * 0.5 + night_factor * 0.5;
    if score >= config.intensity_high {
        Grade3::Strong
    } else if score <= config.intensity_low {
        Grade3::Weak
    } else {
        Grade3::NotSignificant
    }
}

/// Radicalism: microblog/overseas proportions and VPN usage, with grade
/// volatility and a low average as a stress proxy.
fn radicalism_axis(
    proportions: &BTreeMap<DomainCategory, f64>,
    vpn_ratio: f64,
    grades: &[&GradeRecord],
    config: &AnalysisConfig,
) -> Grade3 {
    let p = |c: DomainCategory| proportions.get(&c).copied().unwrap_or(0.0);

    let mut score = 0.0;
    score += p(DomainCategory::Microblog) * 5.0;
    score += p(DomainCategory::OverseasPlatform) * 8.0;
    score += vpn_ratio * 10.0;

    let all_scores: Vec<f64> = grades
        .iter()
        .flat_map(|r| r.subjects.values().copied())
        .filter(|s| s.is_finite())
        .collect();
    if !all_scores.is_empty() {
        if stats::std_dev(&all_scores) > 12.0 {
            score += 2.0;
        }
        if stats::mean(&all_scores) < 60.0 {
            score += 1.0;
        }
    }

    if score >= config.radicalism_high {
        Grade3::Strong
    } else if score <= config.radicalism_low {
        Grade3::Weak
    } else {
        Grade3::NotSignificant
    }
}

/// One row of the archetype decision table.
struct ProfileRule {
    matches: fn(Polarity, Grade3, Grade3) -> bool,
    archetype: &'static str,
    strategy: &'static str,
}

/// Ordered decision table, first match wins. Rows 2 and 3 are shadowed by
/// row 1 on the `(negative, strong, strong)` triple; the source heuristics
/// define all three and the first wins, so the order here is load-bearing.
const PROFILE_RULES: &[ProfileRule] = &[
    ProfileRule {
        matches: |pos, emo, rad| {
            matches!(pos, Polarity::Positive | Polarity::Negative)
                && emo == Grade3::Strong
                && rad == Grade3::Strong
        },
        archetype: "active-radical",
        strategy: "close watch",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::Negative && emo == Grade3::Strong && rad == Grade3::Strong
        },
        archetype: "overseas-affinity",
        strategy: "close watch",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::Negative && emo == Grade3::Strong && rad == Grade3::Strong
        },
        archetype: "relative-deprivation",
        strategy: "supportive care, close watch",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::Positive && emo == Grade3::Weak && rad == Grade3::NotSignificant
        },
        archetype: "professional-creator",
        strategy: "familiarize",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::NotSignificant && emo == Grade3::Strong && rad == Grade3::Weak
        },
        archetype: "highbrow-niche",
        strategy: "familiarize",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::NotSignificant && emo == Grade3::NotSignificant && rad == Grade3::Weak
        },
        archetype: "cautious-observer",
        strategy: "supportive care, resolve needs",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::NotSignificant && emo == Grade3::Weak && rad == Grade3::Weak
        },
        archetype: "present-immersed",
        strategy: "familiarize",
    },
    ProfileRule {
        matches: |pos, emo, rad| {
            pos == Polarity::NotSignificant && emo == Grade3::Weak && rad == Grade3::NotSignificant
        },
        archetype: "traffic-incentive",
        strategy: "familiarize",
    },
];

/// Resolve the axis triple to (archetype, strategy). Falls through the
/// ordered default rules when no table row matches.
pub fn resolve_profile(pos: Polarity, emo: Grade3, rad: Grade3) -> (&'static str, &'static str) {
    for rule in PROFILE_RULES {
        if (rule.matches)(pos, emo, rad) {
            return (rule.archetype, rule.strategy);
        }
    }
    if rad == Grade3::Strong {
        return ("radical-leaning", "close watch");
    }
    if pos == Polarity::Negative {
        return ("latent-risk", "early-warning review");
    }
    if pos == Polarity::Positive {
        return ("core-potential", "cultivate and select");
    }
    ("routine", "periodic check-in")
}

/// Top two visited categories, excluding `other`; drives the typical scene
/// independently of the decision table.
fn dominant_categories(sessions: &[&NetworkSession]) -> Vec<String> {
    let mut counts: BTreeMap<DomainCategory, usize> = BTreeMap::new();
    for session in sessions {
        let category = DomainCategory::classify(&session.domain);
        if category != DomainCategory::Other {
            *counts.entry(category).or_default() += 1;
        }
    }
    let mut ranked: Vec<(DomainCategory, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(2)
        .map(|(category, _)| category.label().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(student: &str, day: u32, hour: u32, domain: &str, vpn: bool) -> NetworkSession {
        let at = NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap();
        NetworkSession {
            student_id: student.into(),
            started_at: at,
            ended_at: at + chrono::Duration::minutes(45),
            domain: domain.into(),
            used_vpn: vpn,
        }
    }

    #[test]
    fn domains_classify_by_substring() {
        assert_eq!(
            DomainCategory::classify("api.github.com"),
            DomainCategory::StudyResearch
        );
        assert_eq!(
            DomainCategory::classify("m.weibo.com"),
            DomainCategory::Microblog
        );
        assert_eq!(DomainCategory::classify(""), DomainCategory::Other);
        assert_eq!(
            DomainCategory::classify("unknown.example"),
            DomainCategory::Other
        );
    }

    #[test]
    fn studious_student_profiles_positive_without_raising() {
        // 100% study/research visits, no VPN, activity sitting on the cohort
        // baseline (single-student population).
        let mut sessions = Vec::new();
        for day in 1..=2 {
            for hour in 9..=17 {
                sessions.push(session("s1", day, hour, "github.com", false));
            }
            sessions.push(session("s1", day, 23, "stackoverflow.com", false));
        }
        let analysis =
            classify_population(&sessions, &[], &AnalysisConfig::default());
        assert_eq!(analysis.profiles.len(), 1);
        let profile = &analysis.profiles[0];
        assert_eq!(profile.positivity, Polarity::Positive);
        assert_eq!(profile.intensity, Grade3::NotSignificant);
        assert_eq!(profile.radicalism, Grade3::Weak);
        assert_eq!(profile.archetype, "core-potential");
        assert_eq!(profile.dominant_categories[0], "study-research");
    }

    #[test]
    fn first_match_wins_on_the_duplicated_triple() {
        // The table defines three rows matching (negative, strong, strong);
        // the first must win and the later two stay dead.
        let (archetype, strategy) =
            resolve_profile(Polarity::Negative, Grade3::Strong, Grade3::Strong);
        assert_eq!(archetype, "active-radical");
        assert_eq!(strategy, "close watch");
        assert_ne!(archetype, "overseas-affinity");
        assert_ne!(archetype, "relative-deprivation");
    }

    #[test]
    fn default_rules_apply_in_order() {
        assert_eq!(
            resolve_profile(Polarity::Positive, Grade3::Strong, Grade3::Strong).0,
            "active-radical"
        );
        assert_eq!(
            resolve_profile(Polarity::Positive, Grade3::NotSignificant, Grade3::Strong).0,
            "radical-leaning"
        );
        assert_eq!(
            resolve_profile(Polarity::Negative, Grade3::Weak, Grade3::Weak).0,
            "latent-risk"
        );
        assert_eq!(
            resolve_profile(
                Polarity::NotSignificant,
                Grade3::NotSignificant,
                Grade3::NotSignificant
            )
            .0,
            "routine"
        );
    }

    #[test]
    fn vpn_heavy_overseas_usage_raises_radicalism() {
        let mut sessions = Vec::new();
        for day in 1..=3 {
            for _ in 0..4 {
                sessions.push(session("s2", day, 23, "twitter.com", true));
            }
        }
        let analysis = classify_population(&sessions, &[], &AnalysisConfig::default());
        let profile = &analysis.profiles[0];
        assert_eq!(profile.radicalism, Grade3::Strong);
        assert_eq!(profile.positivity, Polarity::Negative);
        assert_eq!(analysis.summary.close_watch, 1);
    }

    #[test]
    fn empty_network_population_yields_empty_profiles() {
        let analysis = classify_population(&[], &[], &AnalysisConfig::default());
        assert!(analysis.profiles.is_empty());
        assert_eq!(analysis.summary.total_students, 0);
    }

    #[test]
    fn typical_scene_joins_top_categories() {
        let sessions = vec![
            session("s3", 1, 10, "bilibili.com", false),
            session("s3", 1, 11, "bilibili.com", false),
            session("s3", 1, 12, "zhihu.com", false),
            session("s3", 1, 13, "nowhere.example", false),
        ];
        let analysis = classify_population(&sessions, &[], &AnalysisConfig::default());
        let profile = &analysis.profiles[0];
        assert_eq!(profile.typical_scene, "video-community/qa-community");
    }
}
