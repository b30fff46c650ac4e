use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{EnvConfig, RewardConfig};
use crate::features::extract_features;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up,
    Right,
    Down,
    Left,
}

impl Direction {
    /// Clockwise from north. Feature encodings use this order.
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Right,
        Direction::Down,
        Direction::Left,
    ];

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    pub fn turn_right(&self) -> Direction {
        match self {
            Direction::Up => Direction::Right,
            Direction::Right => Direction::Down,
            Direction::Down => Direction::Left,
            Direction::Left => Direction::Up,
        }
    }

    pub fn turn_left(&self) -> Direction {
        self.turn_right().opposite()
    }

    pub fn delta(&self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Right => (1, 0),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
        }
    }
}

pub const ACTION_COUNT: usize = 3;

/// Moves relative to the current heading. A 180° reversal is not expressible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Straight = 0,
    TurnRight = 1,
    TurnLeft = 2,
}

impl Action {
    pub const ALL: [Action; ACTION_COUNT] = [Action::Straight, Action::TurnRight, Action::TurnLeft];

    pub fn from_index(index: usize) -> Option<Action> {
        Self::ALL.get(index).copied()
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn apply(&self, heading: Direction) -> Direction {
        match self {
            Action::Straight => heading,
            Action::TurnRight => heading.turn_right(),
            Action::TurnLeft => heading.turn_left(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Point { x, y }
    }

    pub fn offset(&self, dx: i32, dy: i32) -> Point {
        Point {
            x: self.x + dx,
            y: self.y + dy,
        }
    }

    pub fn manhattan(&self, other: Point) -> i32 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }
}

/// Result of one environment step.
#[derive(Clone, Debug)]
pub struct Step {
    pub features: Vec<f32>,
    pub reward: f64,
    pub done: bool,
    pub score: i64,
}

/// The game as seen by the learner: feature vectors in, relative actions out.
pub trait Environment {
    fn reset(&mut self) -> Vec<f32>;
    fn step(&mut self, action: Action) -> Step;
    fn score(&self) -> i64;
}

pub struct SnakeEngine {
    pub width: i32,
    pub height: i32,
    /// Head first.
    pub snake: Vec<Point>,
    pub direction: Direction,
    pub food: Point,
    pub score: i64,
    pub game_over: bool,
    pub steps_without_food: u32,
    timeout: u32,
    rewards: RewardConfig,
    rng: StdRng,
}

impl SnakeEngine {
    pub fn new(config: &EnvConfig, rewards: RewardConfig) -> Self {
        Self::with_rng(config, rewards, StdRng::seed_from_u64(config.seed))
    }

    pub fn with_rng(config: &EnvConfig, rewards: RewardConfig, rng: StdRng) -> Self {
        let mut engine = SnakeEngine {
            width: config.width,
            height: config.height,
            snake: Vec::new(),
            direction: Direction::Right,
            food: Point::new(0, 0),
            score: 0,
            game_over: false,
            steps_without_food: 0,
            timeout: config.timeout(),
            rewards,
            rng,
        };
        engine.reset_state();
        engine
    }

    pub fn head(&self) -> Point {
        self.snake[0]
    }

    pub fn len(&self) -> usize {
        self.snake.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snake.is_empty()
    }

    pub fn in_bounds(&self, p: Point) -> bool {
        p.x >= 0 && p.x < self.width && p.y >= 0 && p.y < self.height
    }

    /// Wall or any snake cell, tail included.
    pub fn is_blocked(&self, p: Point) -> bool {
        !self.in_bounds(p) || self.snake.contains(&p)
    }

    fn reset_state(&mut self) {
        let mid_x = self.width / 2;
        let mid_y = self.height / 2;
        self.snake = vec![
            Point::new(mid_x, mid_y),
            Point::new(mid_x - 1, mid_y),
            Point::new(mid_x - 2, mid_y),
        ];
        self.direction = Direction::Right;
        self.score = 0;
        self.game_over = false;
        self.steps_without_food = 0;
        self.food = self
            .spawn_food()
            .expect("a fresh board always has a free cell");
    }

    fn advance(&mut self, action: Action) -> (f64, bool) {
        if self.game_over {
            return (0.0, true);
        }

        let prev_dist = self.head().manhattan(self.food);
        self.direction = action.apply(self.direction);
        let (dx, dy) = self.direction.delta();
        let new_head = self.head().offset(dx, dy);

        self.steps_without_food += 1;

        if self.is_blocked(new_head) {
            self.game_over = true;
            return (self.rewards.collision, true);
        }
        if self.steps_without_food >= self.timeout {
            self.game_over = true;
            return (self.rewards.timeout, true);
        }

        self.snake.insert(0, new_head);
        let mut reward = self.shaping_reward(prev_dist);

        if new_head == self.food {
            self.score += 1;
            self.steps_without_food = 0;
            reward += self.rewards.food_base
                + (self.snake.len() as f64).powf(self.rewards.food_length_exponent);
            match self.spawn_food() {
                Some(food) => self.food = food,
                // Board is full: nothing left to eat.
                None => self.game_over = true,
            }
        } else {
            self.snake.pop();
        }

        debug_assert!(self.game_over || !self.snake.contains(&self.food));
        (reward, self.game_over)
    }

    /// Survival bonus plus distance shaping; the terms add up.
    fn shaping_reward(&self, prev_dist: i32) -> f64 {
        let head = self.head();
        let dist = head.manhattan(self.food);

        let mut reward = self.rewards.survival;
        if dist < prev_dist {
            reward += self.rewards.closer;
        } else if dist > prev_dist {
            reward += self.rewards.farther;
        }

        if head.x == 0 || head.x == self.width - 1 || head.y == 0 || head.y == self.height - 1 {
            reward -= self.rewards.edge_penalty;
        }
        if f64::from(self.steps_without_food) > f64::from(self.timeout) * self.rewards.stall_fraction {
            reward -= self.rewards.stall_penalty;
        }

        reward
    }

    fn spawn_food(&mut self) -> Option<Point> {
        let mut free = Vec::new();
        for x in 0..self.width {
            for y in 0..self.height {
                let p = Point::new(x, y);
                if !self.snake.contains(&p) {
                    free.push(p);
                }
            }
        }
        if free.is_empty() {
            return None;
        }
        Some(free[self.rng.gen_range(0..free.len())])
    }
}

impl Environment for SnakeEngine {
    fn reset(&mut self) -> Vec<f32> {
        self.reset_state();
        extract_features(self)
    }

    fn step(&mut self, action: Action) -> Step {
        let (reward, done) = self.advance(action);
        Step {
            features: extract_features(self),
            reward,
            done,
            score: self.score,
        }
    }

    fn score(&self) -> i64 {
        self.score
    }
}
