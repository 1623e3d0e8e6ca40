use crate::models::{
    date_key, BudgetStatus, BudgetSummary, DailyCompletion, Habit, HabitStats, Transaction,
    TransactionKind,
};
use chrono::{Datelike, Duration, Local, NaiveDate};
use std::collections::BTreeMap;

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub fn calculate_streak(habit: &Habit) -> u32 {
    calculate_streak_at(habit, today())
}

/// Consecutive completed days ending today, or ending yesterday when today is
/// not done yet. Only today is allowed to be missing.
pub fn calculate_streak_at(habit: &Habit, today: NaiveDate) -> u32 {
    let mut streak = u32::from(habit.history.contains(today));
    let mut cursor = today.pred_opt();
    while let Some(day) = cursor.filter(|day| habit.history.contains(*day)) {
        streak += 1;
        cursor = day.pred_opt();
    }
    streak
}

pub fn build_stats(habits: &[Habit]) -> HabitStats {
    build_stats_at(habits, today())
}

pub fn build_stats_at(habits: &[Habit], today: NaiveDate) -> HabitStats {
    let total = habits.len();
    if total == 0 {
        return HabitStats {
            completed: 0,
            total: 0,
            percentage: 0,
            best_streak: 0,
        };
    }

    let completed = habits
        .iter()
        .filter(|habit| habit.history.contains(today))
        .count();

    HabitStats {
        completed,
        total,
        percentage: percent(completed, total),
        best_streak: perfect_streak_at(habits, today),
    }
}

/// Run of days on which every habit was completed. Today counts when it is
/// already perfect; the backward walk always starts at yesterday.
fn perfect_streak_at(habits: &[Habit], today: NaiveDate) -> u32 {
    let all_done = |day: NaiveDate| habits.iter().all(|habit| habit.history.contains(day));

    let mut streak = u32::from(all_done(today));
    let mut cursor = today.pred_opt();
    while let Some(day) = cursor.filter(|day| all_done(*day)) {
        streak += 1;
        cursor = day.pred_opt();
    }
    streak
}

pub fn completion_series_at(habits: &[Habit], today: NaiveDate, days: u32) -> Vec<DailyCompletion> {
    (0..days)
        .rev()
        .map(|offset| {
            let date = today - Duration::days(i64::from(offset));
            let eligible: Vec<&Habit> = habits
                .iter()
                .filter(|habit| habit.created_at.date_naive() <= date)
                .collect();
            let completed = eligible
                .iter()
                .filter(|habit| habit.history.contains(date))
                .count();
            DailyCompletion {
                date: date_key(date),
                eligible: eligible.len(),
                completed,
                percentage: percent(completed, eligible.len()),
            }
        })
        .collect()
}

pub fn budget_summary_at(
    transactions: &[Transaction],
    limit: f64,
    today: NaiveDate,
    category: Option<&str>,
) -> BudgetSummary {
    let (global_income, global_expense) = totals(transactions.iter());

    let filtered: Vec<&Transaction> = transactions
        .iter()
        .filter(|tx| category.is_none_or(|wanted| tx.category == wanted))
        .collect();
    let (income, expense) = totals(filtered.iter().copied());

    let mut by_category = BTreeMap::new();
    for tx in filtered.iter().filter(|tx| tx.kind == TransactionKind::Expense) {
        *by_category.entry(tx.category.clone()).or_insert(0.0) += tx.amount;
    }

    let month_expenses: f64 = transactions
        .iter()
        .filter(|tx| {
            tx.kind == TransactionKind::Expense
                && tx.date.year() == today.year()
                && tx.date.month() == today.month()
        })
        .map(|tx| tx.amount)
        .sum();

    let (limit, progress, remaining, status) = if limit > 0.0 {
        let progress = (month_expenses * 100.0 / limit).min(100.0);
        let status = if progress < 75.0 {
            BudgetStatus::Healthy
        } else if progress < 90.0 {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Over
        };
        (
            Some(limit),
            Some(progress),
            Some((limit - month_expenses).max(0.0)),
            Some(status),
        )
    } else {
        (None, None, None, None)
    };

    BudgetSummary {
        balance: global_income - global_expense,
        income,
        expense,
        month_expenses,
        limit,
        progress,
        remaining,
        status,
        by_category,
    }
}

fn totals<'a>(transactions: impl Iterator<Item = &'a Transaction>) -> (f64, f64) {
    transactions.fold((0.0, 0.0), |(income, expense), tx| match tx.kind {
        TransactionKind::Income => (income + tx.amount, expense),
        TransactionKind::Expense => (income, expense + tx.amount),
    })
}

fn percent(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    (part as f64 / whole as f64 * 100.0).round() as u32
}
