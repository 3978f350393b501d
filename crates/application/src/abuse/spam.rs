//! 启发式垃圾消息评分
//!
//! 评分只依赖消息内容和发送者近期行为，同样的输入总是得到同样的分数。

use domain::SenderHistory;
use regex::Regex;

/// 默认垃圾判定阈值
pub const DEFAULT_SPAM_THRESHOLD: u8 = 70;

const LEXICON: &[&str] = &[
    "click here",
    "buy now",
    "limited time",
    "act now",
    "free money",
    "100% free",
    "guaranteed profit",
    "work from home",
    "earn $",
    "wire transfer",
    "western union",
    "gift card",
    "crypto investment",
    "bitcoin",
    "casino",
    "lottery",
    "you have won",
    "pay outside",
    "off-platform payment",
    "whatsapp me",
    "telegram me",
];

/// 每个词条的分值及总上限
const LEXICON_HIT_POINTS: u32 = 15;
const LEXICON_CAP: u32 = 45;

pub struct SpamScorer {
    url_pattern: Regex,
}

impl Default for SpamScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpamScorer {
    pub fn new() -> Self {
        Self {
            url_pattern: Regex::new(r"(?i)\b(?:https?://|www\.)[^\s<>]+").expect("static regex"),
        }
    }

    /// 计算 0..=100 的垃圾评分
    pub fn score(&self, content: &str, history: &SenderHistory) -> u8 {
        let score = self.lexicon_points(content)
            + self.link_points(content)
            + length_points(content)
            + shouting_points(content)
            + history_points(history)
            + velocity_points(history);
        let score = score.min(100) as u8;
        if score > 0 {
            tracing::debug!(score, "垃圾评分");
        }
        score
    }

    fn lexicon_points(&self, content: &str) -> u32 {
        let lower = content.to_lowercase();
        let hits = LEXICON.iter().filter(|term| lower.contains(*term)).count() as u32;
        (hits * LEXICON_HIT_POINTS).min(LEXICON_CAP)
    }

    /// 链接数量以及链接字符占全文的比例
    fn link_points(&self, content: &str) -> u32 {
        let total_chars = content.chars().count();
        if total_chars == 0 {
            return 0;
        }
        let (count, link_chars) = self
            .url_pattern
            .find_iter(content)
            .fold((0u32, 0usize), |(count, chars), m| {
                (count + 1, chars + m.as_str().chars().count())
            });
        if count == 0 {
            return 0;
        }

        let ratio = link_chars as f64 / total_chars as f64;
        let mut points = (ratio * 35.0).round() as u32;
        if count >= 3 {
            points += 15;
        } else if count == 2 {
            points += 5;
        }
        // 几乎只有链接的短消息
        let text_words = self
            .url_pattern
            .replace_all(content, " ")
            .split_whitespace()
            .count();
        if text_words < 4 {
            points += 10;
        }
        points.min(45)
    }
}

fn length_points(content: &str) -> u32 {
    let chars = content.chars().count();
    let mut points = 0;
    if chars > 2_000 {
        points += 10;
    }
    if longest_run(content) >= 12 {
        points += 10;
    }
    points
}

/// 大写字母占比过高视为喊叫
fn shouting_points(content: &str) -> u32 {
    let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.len() < 20 {
        return 0;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    if upper * 10 >= letters.len() * 7 {
        15
    } else {
        0
    }
}

/// 发送者最近一天被标记的比例
fn history_points(history: &SenderHistory) -> u32 {
    if history.messages_last_day < 3 {
        return 0;
    }
    let rate = f64::from(history.spam_flagged_last_day) / f64::from(history.messages_last_day);
    (rate.min(1.0) * 30.0).round() as u32
}

fn velocity_points(history: &SenderHistory) -> u32 {
    match history.messages_last_minute {
        0..=4 => 0,
        5..=9 => 10,
        10..=19 => 20,
        _ => 30,
    }
}

fn longest_run(content: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    let mut previous = None;
    for ch in content.chars() {
        if Some(ch) == previous && !ch.is_whitespace() {
            current += 1;
        } else {
            current = 1;
            previous = Some(ch);
        }
        longest = longest.max(current);
    }
    longest
}
